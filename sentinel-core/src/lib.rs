pub mod clock;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod eventlog;
pub mod fanout;
pub mod ingest;
pub mod materializer;
pub mod metrics;
pub mod normalize;
pub mod record;
pub mod retry;
pub mod rpc;
pub mod types;
pub mod validation;
pub mod watcher;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{
    DedupeConfig, EventLogConfig, FanoutConfig, IdentityShape, IngestConfig, LogsFilter,
    MaterializerConfig, StartPosition, WatcherConfig,
};
pub use db::{Database, EventRecord, LogEvent, LogEventQuery, LogEventRow, TransactionSummary};
pub use dedupe::{DedupeGuard, DedupeKey, DedupeStore, MemoryDedupeStore, RedisDedupeStore};
pub use error::{Result, SentinelError};
pub use eventlog::{Cursor, EventLog, LogEntry, MemoryEventLog, RedisEventLog};
pub use fanout::{ChannelSink, EventFilter, EventSink, Fanout, LiveEvent, LiveHub, TracingSink};
pub use ingest::{IngestOutcome, Ingestor};
pub use materializer::{Materializer, PassOutcome};
pub use metrics::{HealthCheck, HealthStatus, Metrics, MetricsSnapshot};
pub use normalize::{events_from_notification, normalize_transaction, parse_notification_frame};
pub use record::LogRecord;
pub use retry::{Backoff, Retry, RetryPolicy};
pub use rpc::RpcClient;
pub use types::{CanonicalEvent, Commitment, EventKind, LogId, RawNotification, Slot, TransactionRow};
pub use watcher::{SourceWatcher, WatcherHandle, WatcherState};
