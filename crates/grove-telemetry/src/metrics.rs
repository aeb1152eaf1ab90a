use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Metric names recorded by the fan-out service.
pub mod names {
    pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
    pub const WS_ACTIVE_CONNECTIONS: &str = "ws_active_connections";
    pub const BROADCAST_TOTAL: &str = "broadcast_total";
    pub const BROADCAST_DELIVERIES_TOTAL: &str = "broadcast_deliveries_total";
    pub const BROADCAST_EVICTIONS_TOTAL: &str = "broadcast_evictions_total";
    pub const BROADCAST_DURATION_MS: &str = "broadcast_duration_ms";
    pub const MUTATIONS_TOTAL: &str = "mutations_total";
}

/// Observations kept per histogram. Older samples are discarded first.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// A persisted snapshot row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

/// Filter for persisted snapshot rows, also the query string of
/// `GET /metrics/history`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Point-in-time view of every live metric, served by `GET /metrics`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    pub counters: Vec<MetricValue>,
    pub gauges: Vec<MetricValue>,
    pub histograms: Vec<HistogramValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricValue {
    pub name: String,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub labels: HashMap<String, String>,
    pub value: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistogramValue {
    pub name: String,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub labels: HashMap<String, String>,
    #[serde(flatten)]
    pub summary: HistogramSummary,
}

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauges hold whole numbers (connection counts), so a plain signed atomic
/// is enough.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sliding window of the most recent observations.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    total_count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(HISTOGRAM_WINDOW)),
            total_count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
        self.total_count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.total_count.load(Ordering::Relaxed),
            window_sum: sorted.iter().sum(),
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: sorted[n - 1],
        }
    }
}

/// `count` covers every observation ever recorded; the other fields
/// describe the retained window.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub window_sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> HashMap<String, String> {
        self.labels.iter().cloned().collect()
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        serde_json::to_string(&self.label_map()).ok()
    }
}

/// Lock-light in-process metrics with optional periodic persistence to
/// SQLite.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
    db: Option<Mutex<Connection>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MetricsRecorder {
    /// Recorder without a snapshot database. `snapshot` becomes a no-op.
    pub fn in_memory() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Recorder that persists snapshots to the database at `db_path`.
    pub fn with_snapshot_db(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            db: Some(Mutex::new(conn)),
            ..Self::in_memory()
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.increment(n);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.set(value);
            return;
        }
        self.gauges.write().entry(key).or_insert_with(Gauge::new).set(value);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Current values of every metric, sorted by name then labels.
    pub fn report(&self) -> MetricsReport {
        let mut counters: Vec<(MetricKey, f64)> = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), c.get() as f64))
            .collect();
        counters.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));

        let mut gauges: Vec<(MetricKey, f64)> = self
            .gauges
            .read()
            .iter()
            .map(|(k, g)| (k.clone(), g.get() as f64))
            .collect();
        gauges.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));

        let mut histograms: Vec<(MetricKey, HistogramSummary)> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| (k.clone(), h.summary()))
            .collect();
        histograms.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));

        let value = |(key, value): (MetricKey, f64)| MetricValue {
            labels: key.label_map(),
            name: key.name,
            value,
        };

        MetricsReport {
            counters: counters.into_iter().map(value).collect(),
            gauges: gauges.into_iter().map(value).collect(),
            histograms: histograms
                .into_iter()
                .map(|(key, summary)| HistogramValue {
                    labels: key.label_map(),
                    name: key.name,
                    summary,
                })
                .collect(),
        }
    }

    /// Persist every current value. Histograms store their p50.
    /// Returns the number of rows written, 0 when there is no snapshot db.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let mut rows: Vec<(MetricKey, f64, MetricType)> = Vec::new();
        rows.extend(
            self.counters
                .read()
                .iter()
                .map(|(k, c)| (k.clone(), c.get() as f64, MetricType::Counter)),
        );
        rows.extend(
            self.gauges
                .read()
                .iter()
                .map(|(k, g)| (k.clone(), g.get() as f64, MetricType::Gauge)),
        );
        rows.extend(
            self.histograms
                .read()
                .iter()
                .map(|(k, h)| (k.clone(), h.summary().p50, MetricType::Histogram)),
        );

        let now = Utc::now().to_rfc3339();
        let mut conn = db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (key, value, metric_type) in &rows {
                stmt.execute(rusqlite::params![
                    now,
                    key.name,
                    value,
                    key.labels_json(),
                    metric_type.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let db = db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let metric_type = match row.get::<_, String>(5)?.as_str() {
                "gauge" => MetricType::Gauge,
                "histogram" => MetricType::Histogram,
                _ => MetricType::Counter,
            };
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type,
            })
        })?;
        rows.collect()
    }

    /// Drop snapshot rows older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}
