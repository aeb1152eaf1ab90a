/// Smallest number of children a factory may produce.
pub const MIN_CHILDREN: u32 = 1;
/// Largest number of children a factory may produce.
pub const MAX_CHILDREN: u32 = 15;

/// Coarse classification shared by every error that crosses the HTTP boundary.
/// The REST layer maps this to a status code; nobody inspects messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

/// A factory or tree mutation that would violate a domain invariant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Lower bound must be less than upper bound")]
    BoundsInverted { lower: i64, upper: i64 },

    #[error("Child count must be between {} and {}", MIN_CHILDREN, MAX_CHILDREN)]
    ChildCountOutOfRange { count: i64 },

    #[error("{field} must not be empty")]
    EmptyName { field: &'static str },
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}
