//! REST handlers. Every successful mutation is relayed to all viewers as
//! exactly one event built from the committed snapshot.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use grove_core::ids::FactoryId;
use grove_core::{Event, Factory, FactoryPatch, NewFactory, Tree, TreePatch};
use grove_store::{Database, FactoryRepo, TreeRepo};
use grove_telemetry::{
    names, LogQuery, LogRecord, MetricsQuery, MetricsRecorder, MetricsReport, MetricsSnapshot,
    SqliteLogSink,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::error::{ApiError, StoreContext};

pub struct HandlerState {
    pub trees: TreeRepo,
    pub factories: FactoryRepo,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Arc<MetricsRecorder>,
    /// Persisted warn+ logs. `None` when SQLite logging is off.
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<MetricsRecorder>,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> Self {
        Self {
            trees: TreeRepo::new(db.clone()),
            factories: FactoryRepo::new(db),
            broadcaster,
            metrics,
            logs,
        }
    }

    /// Relay a committed mutation to every connected viewer.
    pub async fn publish(&self, event: Event) -> BroadcastReport {
        self.metrics
            .counter_inc(names::MUTATIONS_TOTAL, &[("action", event.action())], 1);
        self.broadcaster.broadcast_to_all(&event).await
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub message: &'static str,
    pub data: T,
}

fn envelope<T>(message: &'static str, data: T) -> Json<Envelope<T>> {
    Json(Envelope { message, data })
}

type Shared = State<Arc<HandlerState>>;

/// Row cap for the log and metrics history endpoints.
const MAX_HISTORY_ROWS: u32 = 1000;
const DEFAULT_HISTORY_ROWS: u32 = 100;

fn history_limit(requested: Option<u32>) -> Option<u32> {
    Some(requested.unwrap_or(DEFAULT_HISTORY_ROWS).min(MAX_HISTORY_ROWS))
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to the Grove API",
        "docs": "/docs",
    }))
}

/// Route listing served at `/docs`.
pub async fn docs() -> Json<Value> {
    Json(json!({
        "websocket": "/ws",
        "endpoints": [
            "GET /health",
            "GET /metrics",
            "GET /metrics/history",
            "GET /logs",
            "GET /ws/stats",
            "GET /api/tree",
            "PUT /api/tree",
            "DELETE /api/tree",
            "POST /api/factories",
            "GET /api/factories/{factory_id}",
            "PUT /api/factories/{factory_id}",
            "DELETE /api/factories/{factory_id}",
            "POST /api/factories/{factory_id}/generate",
        ],
    }))
}

pub async fn health(State(state): Shared) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "active_connections": state.broadcaster.registry().count(),
    }))
}

pub async fn ws_stats(State(state): Shared) -> Json<Value> {
    Json(json!({ "active_connections": state.broadcaster.registry().count() }))
}

pub async fn metrics(State(state): Shared) -> Json<MetricsReport> {
    Json(state.metrics.report())
}

/// Persisted metric snapshots, newest first. Empty without a snapshot db.
pub async fn metrics_history(
    State(state): Shared,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> Result<Json<Vec<MetricsSnapshot>>, ApiError> {
    let Query(mut query) = query?;
    query.limit = history_limit(query.limit);
    let rows = state
        .metrics
        .query(&query)
        .map_err(|e| ApiError::internal("query metrics", e))?;
    Ok(Json(rows))
}

/// Persisted warn+ logs, newest first. Empty when SQLite logging is off.
pub async fn logs(
    State(state): Shared,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let Query(mut query) = query?;
    let Some(sink) = &state.logs else {
        return Ok(Json(Vec::new()));
    };
    query.limit = history_limit(query.limit);
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::internal("query logs", e))?;
    Ok(Json(records))
}

pub async fn get_tree(State(state): Shared) -> Result<Json<Envelope<Tree>>, ApiError> {
    let tree = state.trees.load_default().during("retrieve tree")?;
    Ok(envelope("Tree retrieved successfully", tree))
}

pub async fn update_tree(
    State(state): Shared,
    payload: Result<Json<TreePatch>, JsonRejection>,
) -> Result<Json<Envelope<Tree>>, ApiError> {
    let Json(patch) = payload?;
    let tree = state.trees.update_default(&patch).during("update tree")?;
    state.publish(Event::tree_updated(&tree)).await;
    Ok(envelope("Tree updated successfully", tree))
}

pub async fn delete_tree(State(state): Shared) -> Result<StatusCode, ApiError> {
    let id = state.trees.delete_default().during("delete tree")?;
    state.publish(Event::tree_deleted(&id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_factory(
    State(state): Shared,
    payload: Result<Json<NewFactory>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Factory>>), ApiError> {
    let Json(input) = payload?;
    let factory = state.factories.create(&input).during("create factory")?;
    state.publish(Event::factory_created(&factory)).await;
    Ok((
        StatusCode::CREATED,
        envelope("Factory created successfully", factory),
    ))
}

pub async fn get_factory(
    State(state): Shared,
    Path(id): Path<FactoryId>,
) -> Result<Json<Envelope<Factory>>, ApiError> {
    let factory = state.factories.get(&id).during("retrieve factory")?;
    Ok(envelope("Factory retrieved successfully", factory))
}

pub async fn update_factory(
    State(state): Shared,
    Path(id): Path<FactoryId>,
    payload: Result<Json<FactoryPatch>, JsonRejection>,
) -> Result<Json<Envelope<Factory>>, ApiError> {
    let Json(patch) = payload?;
    let factory = state.factories.update(&id, &patch).during("update factory")?;
    state.publish(Event::factory_updated(&factory)).await;
    Ok(envelope("Factory updated successfully", factory))
}

pub async fn delete_factory(
    State(state): Shared,
    Path(id): Path<FactoryId>,
) -> Result<StatusCode, ApiError> {
    let tree_id = state.factories.delete(&id).during("delete factory")?;
    state.publish(Event::factory_deleted(&id, &tree_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn generate_children(
    State(state): Shared,
    Path(id): Path<FactoryId>,
) -> Result<Json<Envelope<Factory>>, ApiError> {
    let factory = state
        .factories
        .generate_children(&id, &mut rand::thread_rng())
        .during("generate children")?;
    state.publish(Event::children_generated(&factory)).await;
    Ok(envelope("Children generated successfully", factory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Channel, ChannelRegistry};
    use grove_core::ids::ChannelId;
    use grove_telemetry::SqliteLogLayer;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_db(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("grove-handlers-{}", ChannelId::new()))
            .join(name)
    }

    fn state() -> Arc<HandlerState> {
        state_with(MetricsRecorder::in_memory(), None)
    }

    fn state_with(metrics: MetricsRecorder, logs: Option<Arc<SqliteLogSink>>) -> Arc<HandlerState> {
        let metrics = Arc::new(metrics);
        let registry = Arc::new(ChannelRegistry::new(metrics.clone()));
        let broadcaster = Arc::new(Broadcaster::new(
            registry,
            Duration::from_millis(100),
            metrics.clone(),
        ));
        Arc::new(HandlerState::new(
            Database::in_memory().unwrap(),
            broadcaster,
            metrics,
            logs,
        ))
    }

    fn viewer(state: &HandlerState) -> mpsc::Receiver<String> {
        let (channel, rx) = Channel::new(16);
        state.broadcaster.registry().register(channel);
        rx
    }

    fn next_event(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    async fn create(state: &Arc<HandlerState>, input: NewFactory) -> Result<Factory, ApiError> {
        let (_, Json(body)) = create_factory(State(state.clone()), Ok(Json(input))).await?;
        Ok(body.data)
    }

    #[tokio::test]
    async fn create_relays_factory_created() {
        let state = state();
        let mut rx = viewer(&state);

        let factory = create(&state, NewFactory::new("Primes", 1, 10, 5)).await.unwrap();

        let event = next_event(&mut rx);
        assert_eq!(event["action"], "factory_created");
        assert_eq!(event["data"]["id"], factory.id.as_str());
        assert_eq!(event["data"]["children"], json!([]));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            state
                .metrics
                .counter_get(names::MUTATIONS_TOTAL, &[("action", "factory_created")]),
            1
        );
    }

    #[tokio::test]
    async fn invalid_create_broadcasts_nothing() {
        let state = state();
        let mut rx = viewer(&state);

        let err = create(&state, NewFactory::new("x", 10, 5, 3)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn generate_relays_exactly_the_committed_children() {
        let state = state();
        let factory = create(&state, NewFactory::new("f", 1, 10, 5)).await.unwrap();
        let mut rx = viewer(&state);

        let Json(body) = generate_children(State(state.clone()), Path(factory.id.clone()))
            .await
            .unwrap();
        assert_eq!(body.message, "Children generated successfully");
        assert_eq!(body.data.children.len(), 5);
        assert!(body.data.children.iter().all(|c| (1..=10).contains(&c.value)));

        let event = next_event(&mut rx);
        assert_eq!(event["action"], "children_generated");
        assert_eq!(event["data"]["factory_id"], factory.id.as_str());
        assert_eq!(
            event["data"]["children"],
            serde_json::to_value(&body.data.children).unwrap()
        );
    }

    #[tokio::test]
    async fn update_and_delete_relay_events() {
        let state = state();
        let factory = create(&state, NewFactory::new("f", 1, 10, 5)).await.unwrap();
        let mut rx = viewer(&state);

        let patch = FactoryPatch {
            name: Some("renamed".into()),
            ..Default::default()
        };
        update_factory(State(state.clone()), Path(factory.id.clone()), Ok(Json(patch)))
            .await
            .unwrap();
        let updated = next_event(&mut rx);
        assert_eq!(updated["action"], "factory_updated");
        assert_eq!(updated["data"]["name"], "renamed");
        assert!(updated["data"].get("children").is_none());

        let status = delete_factory(State(state.clone()), Path(factory.id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let deleted = next_event(&mut rx);
        assert_eq!(deleted["action"], "factory_deleted");
        assert_eq!(deleted["data"]["tree_id"], factory.tree_id.as_str());
    }

    #[tokio::test]
    async fn missing_factory_is_404_without_broadcast() {
        let state = state();
        let mut rx = viewer(&state);
        let err = generate_children(State(state.clone()), Path(FactoryId::from_raw("fac_nope")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tree_update_and_delete_relay_events() {
        let state = state();
        let mut rx = viewer(&state);

        let Json(body) = update_tree(
            State(state.clone()),
            Ok(Json(TreePatch {
                name: Some("Orchard".into()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(body.data.name, "Orchard");
        let event = next_event(&mut rx);
        assert_eq!(event, json!({"action": "tree_updated", "data": {"id": body.data.id.as_str(), "name": "Orchard"}}));

        delete_tree(State(state.clone())).await.unwrap();
        let event = next_event(&mut rx);
        assert_eq!(event["action"], "tree_deleted");
        assert_eq!(event["data"]["id"], body.data.id.as_str());
    }

    #[tokio::test]
    async fn reading_the_tree_broadcasts_nothing() {
        let state = state();
        let mut rx = viewer(&state);
        let Json(body) = get_tree(State(state.clone())).await.unwrap();
        assert_eq!(body.data.name, "Default Tree");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn root_links_to_docs() {
        let Json(body) = root().await;
        assert_eq!(body["docs"], "/docs");
        let Json(docs) = docs().await;
        let endpoints = docs["endpoints"].as_array().unwrap();
        assert!(endpoints.iter().any(|e| e == "GET /logs"));
    }

    #[tokio::test]
    async fn logs_endpoint_filters_persisted_warnings() {
        let sink = Arc::new(SqliteLogSink::new(&temp_db("logs.db")).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(channel_id = "chan_slow", "delivery failed, evicting channel");
            tracing::warn!(channel_id = "chan_other", "socket write timed out");
            tracing::info!(channel_id = "chan_slow", "channel opened");
        });
        let state = state_with(MetricsRecorder::in_memory(), Some(sink));

        let query = LogQuery {
            channel_id: Some("chan_slow".into()),
            ..Default::default()
        };
        let Json(records) = logs(State(state.clone()), Ok(Query(query))).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "delivery failed, evicting channel");

        let Json(all) = logs(State(state), Ok(Query(LogQuery::default()))).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn logs_endpoint_is_empty_when_disabled() {
        let Json(records) = logs(State(state()), Ok(Query(LogQuery::default()))).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn metrics_history_reads_snapshots() {
        let recorder = MetricsRecorder::with_snapshot_db(&temp_db("metrics.db")).unwrap();
        let state = state_with(recorder, None);
        create(&state, NewFactory::new("f", 1, 10, 5)).await.unwrap();
        state.metrics.snapshot().unwrap();

        let query = MetricsQuery {
            name: Some(names::MUTATIONS_TOTAL.into()),
            ..Default::default()
        };
        let Json(rows) = metrics_history(State(state), Ok(Query(query))).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 1.0);
        assert_eq!(rows[0].labels.as_deref(), Some(r#"{"action":"factory_created"}"#));
    }

    #[test]
    fn history_limit_is_capped() {
        assert_eq!(history_limit(None), Some(DEFAULT_HISTORY_ROWS));
        assert_eq!(history_limit(Some(5)), Some(5));
        assert_eq!(history_limit(Some(1_000_000)), Some(MAX_HISTORY_ROWS));
    }
}
