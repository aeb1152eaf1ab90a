use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use grove_server::{ServerConfig, DEFAULT_CORS_ORIGINS};
use grove_store::Database;
use grove_telemetry::{grove_home, init_telemetry, TelemetryConfig};
use tracing::Level;

/// Real-time tree and factory server.
#[derive(Debug, Parser)]
#[command(name = "grove", version)]
struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// SQLite database file. Defaults to `~/.grove/grove.db`.
    #[arg(long, env = "GROVE_DATABASE")]
    database: Option<PathBuf>,

    /// Allowed CORS origin. Repeatable or comma-separated.
    #[arg(long = "cors-origin", env = "GROVE_CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// Upper bound on a single delivery to one viewer.
    #[arg(long, env = "GROVE_SEND_TIMEOUT_MS", default_value_t = 5000)]
    send_timeout_ms: u64,

    /// Outbound messages buffered per viewer.
    #[arg(long, env = "GROVE_SEND_QUEUE", default_value_t = 256)]
    send_queue: usize,

    #[arg(long, env = "GROVE_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Warn+ log database. Defaults to `~/.grove/logs.db`.
    #[arg(long, env = "GROVE_LOG_DB")]
    log_db: Option<PathBuf>,

    /// Disable the SQLite log sink.
    #[arg(long)]
    no_log_db: bool,

    /// Persist periodic metrics snapshots to this database.
    #[arg(long, env = "GROVE_METRICS_DB")]
    metrics_db: Option<PathBuf>,
}

impl Cli {
    fn telemetry_config(&self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            log_level: self.log_level,
            log_to_sqlite: !self.no_log_db,
            log_db_path: self.log_db.clone().unwrap_or(defaults.log_db_path.clone()),
            metrics_db_path: self.metrics_db.clone(),
            ..defaults
        }
    }

    fn server_config(&self, telemetry: &TelemetryConfig) -> ServerConfig {
        let cors_origins = if self.cors_origins.is_empty() {
            DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect()
        } else {
            self.cors_origins
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            send_queue: self.send_queue.max(1),
            cors_origins,
            metrics_snapshot_interval: telemetry
                .metrics_db_path
                .as_ref()
                .map(|_| Duration::from_secs(telemetry.metrics_snapshot_interval_secs)),
            metrics_retention_days: telemetry.metrics_retention_days,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let telemetry = cli.telemetry_config();
    let guard = init_telemetry(&telemetry);

    let db_path = cli
        .database
        .clone()
        .unwrap_or_else(|| grove_home().join("grove.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let config = cli.server_config(&telemetry);
    let handle = grove_server::start(config, db, guard.metrics(), guard.logs())
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;
    tracing::info!(addr = %handle.addr(), "grove server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
