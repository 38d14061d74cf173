use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for the ingestion, persistence and live delivery paths.
///
/// Constructed once per process (or per test) and shared as `Arc<Metrics>`.
#[derive(Debug)]
pub struct Metrics {
    /// Notifications received from the watcher (pre-dedupe)
    pub notifications_ingested: AtomicU64,
    /// Notifications dropped because their identity was already accepted
    pub dedupe_dropped: AtomicU64,
    /// Records appended to the durable event log
    pub events_published: AtomicU64,
    /// Appends that failed after retries
    pub publish_failures: AtomicU64,
    /// Number of WebSocket reconnections
    pub ws_reconnections: AtomicU64,
    /// Failed dedupe store round-trips (every attempt)
    pub dedupe_errors: AtomicU64,
    /// Dedupe checks that exhausted their retry budget
    pub dedupe_exhausted: AtomicU64,
    /// Number of RPC calls made
    pub rpc_calls: AtomicU64,
    /// Number of RPC call failures
    pub rpc_failures: AtomicU64,
    /// Successful upserts into the relational store
    pub db_upserts: AtomicU64,
    /// Failed upserts into the relational store
    pub db_upsert_failures: AtomicU64,
    /// Log records skipped because they could not be decoded
    pub malformed_records: AtomicU64,
    /// Records given up on after repeated write failures
    pub lost_records: AtomicU64,
    /// Events delivered to live subscription queues
    pub live_emitted: AtomicU64,
    /// Live events suppressed by the dedupe guard
    pub live_deduped: AtomicU64,
    /// Live events dropped on a full queue or broadcast lag
    pub live_dropped: AtomicU64,
    /// Live stream send failures
    pub stream_errors: AtomicU64,
    /// Live events emitted by kind
    pub emitted_by_kind: Mutex<HashMap<String, u64>>,
    /// Processing start time
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            notifications_ingested: AtomicU64::new(0),
            dedupe_dropped: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            ws_reconnections: AtomicU64::new(0),
            dedupe_errors: AtomicU64::new(0),
            dedupe_exhausted: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_failures: AtomicU64::new(0),
            db_upserts: AtomicU64::new(0),
            db_upsert_failures: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            lost_records: AtomicU64::new(0),
            live_emitted: AtomicU64::new(0),
            live_deduped: AtomicU64::new(0),
            live_dropped: AtomicU64::new(0),
            stream_errors: AtomicU64::new(0),
            emitted_by_kind: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a WebSocket reconnection
    pub fn record_ws_reconnection(&self) {
        Self::incr(&self.ws_reconnections);
    }

    /// Record an RPC call
    pub fn record_rpc_call(&self, failed: bool) {
        Self::incr(&self.rpc_calls);
        if failed {
            Self::incr(&self.rpc_failures);
        }
    }

    /// Record a relational upsert
    pub fn record_db_upsert(&self, failed: bool) {
        if failed {
            Self::incr(&self.db_upsert_failures);
        } else {
            Self::incr(&self.db_upserts);
        }
    }

    /// Record a live emission for the given event kind
    pub fn record_live_emit(&self, kind: &str) {
        Self::incr(&self.live_emitted);
        if let Ok(mut map) = self.emitted_by_kind.lock() {
            *map.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    /// Get total uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let emitted_by_kind = self
            .emitted_by_kind
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            notifications_ingested: load(&self.notifications_ingested),
            dedupe_dropped: load(&self.dedupe_dropped),
            events_published: load(&self.events_published),
            publish_failures: load(&self.publish_failures),
            ws_reconnections: load(&self.ws_reconnections),
            dedupe_errors: load(&self.dedupe_errors),
            dedupe_exhausted: load(&self.dedupe_exhausted),
            rpc_calls: load(&self.rpc_calls),
            rpc_failures: load(&self.rpc_failures),
            db_upserts: load(&self.db_upserts),
            db_upsert_failures: load(&self.db_upsert_failures),
            malformed_records: load(&self.malformed_records),
            lost_records: load(&self.lost_records),
            live_emitted: load(&self.live_emitted),
            live_deduped: load(&self.live_deduped),
            live_dropped: load(&self.live_dropped),
            stream_errors: load(&self.stream_errors),
            emitted_by_kind,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Log current metrics summary
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            "Metrics Summary: {} ingested, {} deduped, {} published, {} upserted ({} failed), {} reconnections, {} live emitted ({} dropped)",
            snapshot.notifications_ingested,
            snapshot.dedupe_dropped,
            snapshot.events_published,
            snapshot.db_upserts,
            snapshot.db_upsert_failures,
            snapshot.ws_reconnections,
            snapshot.live_emitted,
            snapshot.live_dropped
        );
        debug!("Live events by kind: {:?}", snapshot.emitted_by_kind);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub notifications_ingested: u64,
    pub dedupe_dropped: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub ws_reconnections: u64,
    pub dedupe_errors: u64,
    pub dedupe_exhausted: u64,
    pub rpc_calls: u64,
    pub rpc_failures: u64,
    pub db_upserts: u64,
    pub db_upsert_failures: u64,
    pub malformed_records: u64,
    pub lost_records: u64,
    pub live_emitted: u64,
    pub live_deduped: u64,
    pub live_dropped: u64,
    pub stream_errors: u64,
    pub emitted_by_kind: HashMap<String, u64>,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Export as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "notifications_ingested": self.notifications_ingested,
            "dedupe_dropped": self.dedupe_dropped,
            "events_published": self.events_published,
            "publish_failures": self.publish_failures,
            "ws_reconnections": self.ws_reconnections,
            "dedupe_errors": self.dedupe_errors,
            "dedupe_exhausted": self.dedupe_exhausted,
            "rpc_calls": self.rpc_calls,
            "rpc_failures": self.rpc_failures,
            "db_upserts": self.db_upserts,
            "db_upsert_failures": self.db_upsert_failures,
            "malformed_records": self.malformed_records,
            "lost_records": self.lost_records,
            "live_emitted": self.live_emitted,
            "live_deduped": self.live_deduped,
            "live_dropped": self.live_dropped,
            "stream_errors": self.stream_errors,
            "emitted_by_kind": self.emitted_by_kind,
            "uptime_seconds": self.uptime_seconds,
        })
    }
}

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check derived from reconnection count and RPC failure rate
pub struct HealthCheck {
    metrics: Arc<Metrics>,
    max_reconnections: u64,
    max_failure_rate: f64,
}

impl HealthCheck {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            max_reconnections: 10,
            max_failure_rate: 0.5,
        }
    }

    /// Configure max reconnections before marking as degraded
    pub fn with_max_reconnections(mut self, max: u64) -> Self {
        self.max_reconnections = max;
        self
    }

    /// Configure max failure rate before marking as degraded
    pub fn with_max_failure_rate(mut self, rate: f64) -> Self {
        self.max_failure_rate = rate;
        self
    }

    /// Check current health status
    pub fn check(&self) -> HealthStatus {
        let reconnections = self.metrics.ws_reconnections.load(Ordering::Relaxed);
        let rpc_calls = self.metrics.rpc_calls.load(Ordering::Relaxed);
        let rpc_failures = self.metrics.rpc_failures.load(Ordering::Relaxed);

        if reconnections > self.max_reconnections * 2 {
            return HealthStatus::Unhealthy;
        }

        if rpc_calls > 0 {
            let failure_rate = rpc_failures as f64 / rpc_calls as f64;
            if failure_rate > self.max_failure_rate {
                return HealthStatus::Degraded;
            }
        }

        if reconnections > self.max_reconnections {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}
