use crate::config::StartPosition;
use crate::error::Result;
use crate::record::LogRecord;
use crate::types::LogId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use memory::MemoryEventLog;
pub use self::redis::RedisEventLog;

/// Read position in the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Beginning,
    Latest,
    After(LogId),
}

impl Cursor {
    /// Log-native form: `0-0`, `$` or the last consumed ID.
    pub fn as_wire(&self) -> &str {
        match self {
            Cursor::Beginning => "0-0",
            Cursor::Latest => "$",
            Cursor::After(id) => id,
        }
    }

    pub fn advance_to(&mut self, id: &str) {
        *self = Cursor::After(id.to_string());
    }
}

impl From<&StartPosition> for Cursor {
    fn from(start: &StartPosition) -> Self {
        match start {
            StartPosition::Beginning => Cursor::Beginning,
            StartPosition::Latest => Cursor::Latest,
            StartPosition::After(id) => Cursor::After(id.clone()),
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One entry read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: LogId,
    pub fields: HashMap<String, String>,
}

/// Append-only, ID-ordered log of accepted notifications.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a record, returning its log-assigned ID.
    async fn append(&self, record: &LogRecord) -> Result<LogId>;

    /// Up to `max_count` entries strictly after `cursor`, in log order.
    ///
    /// Waits up to `block_for` when nothing is available yet and then
    /// returns an empty batch.
    async fn read_since(
        &self,
        cursor: &Cursor,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<LogEntry>>;
}
