use crate::record::STREAM_NAME;
use crate::retry::RetryPolicy;
use crate::types::Commitment;
use serde::Serialize;
use std::time::Duration;

/// Filter passed as the first `logsSubscribe` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogsFilter {
    All,
    Mentions(Vec<String>),
}

impl LogsFilter {
    /// `Mentions` when any addresses are given, `All` otherwise.
    pub fn from_addresses(addresses: Vec<String>) -> Self {
        if addresses.is_empty() {
            LogsFilter::All
        } else {
            LogsFilter::Mentions(addresses)
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            LogsFilter::All => serde_json::Value::String("all".to_string()),
            LogsFilter::Mentions(addresses) => serde_json::json!({ "mentions": addresses }),
        }
    }
}

impl Serialize for LogsFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub ws_url: String,
    pub filter: LogsFilter,
    pub commitment: Commitment,
    pub ping_interval: Duration,
    /// A connection with no inbound frame (pongs included) for this long is dead.
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub channel_capacity: usize,
}

impl WatcherConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.mainnet-beta.solana.com".to_string(),
            filter: LogsFilter::All,
            commitment: Commitment::Confirmed,
            ping_interval: Duration::from_secs(20),
            read_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(10),
            backoff_floor: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(20),
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupeConfig {
    pub namespace: String,
    /// Timeout applied to every store round-trip.
    pub op_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            namespace: "dedupe".to_string(),
            op_timeout: Duration::from_secs(2),
            retry: RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1))
                .with_max_elapsed(Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub stream: String,
    /// Approximate upper bound on retained entries.
    pub max_len: usize,
    pub op_timeout: Duration,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            stream: STREAM_NAME.to_string(),
            max_len: 100_000,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// Where a fresh materializer starts reading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Replay everything still retained by the log.
    #[default]
    Beginning,
    /// Only entries appended after startup.
    Latest,
    /// Entries strictly after the given log ID.
    After(String),
}

impl StartPosition {
    /// Accepts `0-0`/`beginning`, `$`/`latest`, or a log ID.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "0" | "0-0" | "beginning" => StartPosition::Beginning,
            "$" | "latest" => StartPosition::Latest,
            id => StartPosition::After(id.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    pub batch_size: usize,
    pub block_for: Duration,
    pub start: StartPosition,
    /// Passes a failing record is retried before it is skipped as lost.
    pub max_record_attempts: u32,
    /// Pause after a read error or an unavailable store.
    pub error_backoff: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            block_for: Duration::from_secs(2),
            start: StartPosition::Beginning,
            max_record_attempts: 3,
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub queue_capacity: usize,
    pub hub_capacity: usize,
    pub dedupe_ttl: Duration,
    /// A sink that has not accepted an event within this long is treated as dead.
    pub send_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            hub_capacity: 4096,
            dedupe_ttl: Duration::from_secs(5 * 60),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Identity used for the durable path's dedupe key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityShape {
    #[default]
    Signature,
    SignatureSlot,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub dedupe_ttl: Duration,
    pub identity: IdentityShape,
    pub append_retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl: Duration::from_secs(86_400),
            identity: IdentityShape::Signature,
            append_retry: RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(2))
                .with_max_retries(3),
        }
    }
}
