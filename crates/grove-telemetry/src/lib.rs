mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{
    names, HistogramSummary, HistogramValue, MetricType, MetricValue, MetricsQuery,
    MetricsRecorder, MetricsReport, MetricsSnapshot,
};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. `RUST_LOG` takes precedence when set.
    pub log_level: Level,
    /// Per-module level overrides, e.g. `("grove_store", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// Persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Snapshot database for metrics. `None` keeps metrics in memory only.
    pub metrics_db_path: Option<PathBuf>,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: grove_home().join("logs.db"),
            metrics_db_path: None,
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Holds the telemetry sinks for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared recorder. Always present; persistence depends on config.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    /// The warn+ log sink, when SQLite logging is enabled.
    pub fn logs(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Install the global subscriber and build the metrics recorder. Call once
/// at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("grove-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    let metrics = match &config.metrics_db_path {
        Some(path) => MetricsRecorder::with_snapshot_db(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "failed to open metrics DB, keeping metrics in memory");
            MetricsRecorder::in_memory()
        }),
        None => MetricsRecorder::in_memory(),
    };

    TelemetryGuard {
        log_sink,
        metrics: Arc::new(metrics),
    }
}

fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// `$HOME/.grove`, or `/tmp/.grove` when `HOME` is unset.
pub fn grove_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".grove")
}
