use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use grove_core::ErrorKind;
use grove_store::StoreError;
use serde_json::json;

/// Error returned by REST handlers. Rendered as `{"detail": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body could not be parsed.
    #[error("{0}")]
    BadRequest(String),

    #[error("Failed to {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// A telemetry read failed.
    #[error("Failed to {op}: {detail}")]
    Internal { op: &'static str, detail: String },
}

impl ApiError {
    pub fn internal(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            op,
            detail: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::InvalidInput,
            Self::Store { source, .. } => source.kind(),
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing text. Validation and lookup failures speak for
    /// themselves; internal failures name the operation that broke.
    pub fn detail(&self) -> String {
        match self {
            Self::Store { source, .. } if source.kind() != ErrorKind::Internal => source.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind().as_str(), error = %self, "request rejected");
        }
        (status, Json(json!({ "detail": self.detail() }))).into_response()
    }
}

/// Attach the failing operation to a store result.
pub trait StoreContext<T> {
    fn during(self, op: &'static str) -> Result<T, ApiError>;
}

impl<T> StoreContext<T> for Result<T, StoreError> {
    fn during(self, op: &'static str) -> Result<T, ApiError> {
        self.map_err(|source| ApiError::Store { op, source })
    }
}
