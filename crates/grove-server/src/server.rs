use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRef, State};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use grove_store::Database;
use grove_telemetry::{MetricsRecorder, SqliteLogSink};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::channel;
use crate::handlers::{self, HandlerState};
use crate::registry::ChannelRegistry;

pub const DEFAULT_CORS_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:3000",
    "http://localhost:8080",
];

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single enqueue or socket write to one channel.
    pub send_timeout: Duration,
    /// Outbound messages buffered per channel.
    pub send_queue: usize,
    pub cors_origins: Vec<String>,
    /// Period of the metrics snapshot task. `None` disables it.
    pub metrics_snapshot_interval: Option<Duration>,
    pub metrics_retention_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            send_timeout: Duration::from_secs(5),
            send_queue: 256,
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
            metrics_snapshot_interval: None,
            metrics_retention_days: 7,
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handlers: Arc<HandlerState>,
    pub broadcaster: Arc<Broadcaster>,
    pub send_queue: usize,
}

impl FromRef<AppState> for Arc<HandlerState> {
    fn from_ref(state: &AppState) -> Self {
        state.handlers.clone()
    }
}

impl AppState {
    pub fn new(
        db: Database,
        config: &ServerConfig,
        metrics: Arc<MetricsRecorder>,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> Self {
        let registry = Arc::new(ChannelRegistry::new(metrics.clone()));
        let broadcaster = Arc::new(Broadcaster::new(
            registry,
            config.send_timeout,
            metrics.clone(),
        ));
        let handlers = Arc::new(HandlerState::new(db, broadcaster.clone(), metrics, logs));
        Self {
            handlers,
            broadcaster,
            send_queue: config.send_queue,
        }
    }
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/docs", get(handlers::docs))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/metrics/history", get(handlers::metrics_history))
        .route("/logs", get(handlers::logs))
        .route("/ws", get(ws_handler))
        .route("/ws/stats", get(handlers::ws_stats))
        .route(
            "/api/tree",
            get(handlers::get_tree)
                .put(handlers::update_tree)
                .delete(handlers::delete_tree),
        )
        .route("/api/factories", axum::routing::post(handlers::create_factory))
        .route(
            "/api/factories/{factory_id}",
            get(handlers::get_factory)
                .put(handlers::update_factory)
                .delete(handlers::delete_factory),
        )
        .route(
            "/api/factories/{factory_id}/generate",
            axum::routing::post(handlers::generate_children),
        )
        .with_state(state)
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| channel::run_channel(socket, state.broadcaster, state.send_queue))
}

/// Bind, serve and spawn background tasks. Returns once the listener is
/// bound; port 0 picks a free port.
pub async fn start(
    config: ServerConfig,
    db: Database,
    metrics: Arc<MetricsRecorder>,
    logs: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(db, &config, metrics.clone(), logs);
    let router = build_router(state.clone(), &config.cors_origins);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "grove server started");

    let shutdown = CancellationToken::new();

    let server_token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    let snapshots = config.metrics_snapshot_interval.and_then(|interval| {
        metrics.is_persistent().then(|| {
            spawn_metrics_snapshots(
                metrics.clone(),
                interval,
                config.metrics_retention_days,
                shutdown.clone(),
            )
        })
    });

    Ok(ServerHandle {
        addr: local_addr,
        state,
        shutdown,
        server,
        snapshots,
    })
}

fn spawn_metrics_snapshots(
    metrics: Arc<MetricsRecorder>,
    interval: Duration,
    retention_days: u32,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match metrics.snapshot() {
                Ok(rows) => tracing::debug!(rows, "metrics snapshot written"),
                Err(e) => warn!(error = %e, "metrics snapshot failed"),
            }
            if let Err(e) = metrics.prune(retention_days) {
                warn!(error = %e, "metrics prune failed");
            }
        }
        // Final snapshot so the last interval is not lost.
        if let Err(e) = metrics.snapshot() {
            warn!(error = %e, "final metrics snapshot failed");
        }
    })
}

/// Running server. Dropping it leaves the tasks running; call `shutdown`.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    snapshots: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active_connections(&self) -> usize {
        self.state.broadcaster.registry().count()
    }

    /// Close every open channel and wait for the server task to drain.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.cancel();
        for channel in self.state.broadcaster.registry().snapshot() {
            channel.close();
        }
        if let Err(e) = self.server.await {
            warn!(error = %e, "server task failed");
        }
        if let Some(snapshots) = self.snapshots {
            let _ = snapshots.await;
        }
    }
}
