use crate::{
    error::{Result, SentinelError},
    record::LogRecord,
    types::{CanonicalEvent, Slot, TransactionRow},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod factory;
pub mod postgres;
pub mod sqlite;

pub use factory::create_backend;

pub const DEFAULT_QUERY_LIMIT: usize = 50;
pub const MAX_QUERY_LIMIT: usize = 500;

/// Unsigned value as a signed SQL integer; values past `i64::MAX` are refused.
pub(crate) fn sql_int<T: TryInto<i64> + Copy + std::fmt::Display>(value: T, column: &str) -> Result<i64> {
    value
        .try_into()
        .map_err(|_| SentinelError::Database(format!("{} {} does not fit in BIGINT", column, value)))
}

/// Materialized notification, keyed by signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEventRow {
    pub signature: String,
    pub slot: Slot,
    pub err: Option<serde_json::Value>,
    pub logs: Option<String>,
}

impl LogEventRow {
    pub fn from_record(record: &LogRecord) -> Self {
        let logs = record.joined_logs();
        Self {
            signature: record.signature.clone(),
            slot: record.slot,
            err: record.err.clone(),
            logs: if logs.is_empty() { None } else { Some(logs) },
        }
    }
}

/// Row of `tx_events` as read back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub signature: String,
    pub slot: i64,
    pub err: Option<serde_json::Value>,
    pub logs: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filters for `latest_log_events`
#[derive(Debug, Clone, Default)]
pub struct LogEventQuery {
    pub limit: Option<usize>,
    /// Case-insensitive substring matched against the joined logs.
    pub program_contains: Option<String>,
    pub since_slot: Option<Slot>,
    pub until_slot: Option<Slot>,
}

impl LogEventQuery {
    /// Requested limit clamped to `1..=500`, 50 when unset.
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT) as i64
    }

    /// `LIKE` pattern for `program_contains`, with wildcards escaped.
    pub fn like_pattern(&self) -> Option<String> {
        self.program_contains
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                format!("%{}%", escaped)
            })
    }
}

/// Event record stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub kind: String,
    pub signature: String,
    pub event_index: i64,
    pub slot: i64,
    pub account: Option<String>,
    pub program: Option<String>,
    pub amount: Option<String>,
    pub mint: Option<String>,
    pub raw: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub signature: String,
    pub slot: i64,
    pub block_time: Option<DateTime<Utc>>,
    pub fee: i64,
    pub err: Option<serde_json::Value>,
}

/// Trait defining the database backend interface
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Run database migrations/schema setup
    async fn run_migrations(&self) -> Result<()>;

    /// Round-trip to the database
    async fn health(&self) -> Result<()>;

    /// Insert or overwrite the `tx_events` row for the signature
    async fn upsert_log_event(&self, row: &LogEventRow) -> Result<()>;

    async fn get_log_event(&self, signature: &str) -> Result<Option<LogEvent>>;

    /// Newest rows first
    async fn latest_log_events(&self, query: &LogEventQuery) -> Result<Vec<LogEvent>>;

    async fn upsert_transaction(&self, tx: &TransactionRow) -> Result<()>;

    /// Delete then insert the signature's events in one transaction
    async fn replace_events_for_signature(
        &self,
        signature: &str,
        events: &[CanonicalEvent],
    ) -> Result<usize>;

    async fn get_events_by_signature(&self, signature: &str) -> Result<Vec<EventRecord>>;

    async fn list_recent_transactions(&self, limit: usize) -> Result<Vec<TransactionSummary>>;
}

/// Database wrapper that holds a dynamic backend
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn DatabaseBackend>,
}

impl Database {
    /// Create a new database instance by parsing the URL scheme
    pub async fn new(database_url: &str) -> Result<Self> {
        let backend = create_backend(database_url).await?;
        Ok(Self { backend })
    }

    pub fn from_backend(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self { backend }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        self.backend.run_migrations().await
    }

    pub async fn health(&self) -> Result<()> {
        self.backend.health().await
    }

    pub async fn upsert_log_event(&self, row: &LogEventRow) -> Result<()> {
        self.backend.upsert_log_event(row).await
    }

    pub async fn get_log_event(&self, signature: &str) -> Result<Option<LogEvent>> {
        self.backend.get_log_event(signature).await
    }

    pub async fn latest_log_events(&self, query: &LogEventQuery) -> Result<Vec<LogEvent>> {
        self.backend.latest_log_events(query).await
    }

    pub async fn upsert_transaction(&self, tx: &TransactionRow) -> Result<()> {
        self.backend.upsert_transaction(tx).await
    }

    pub async fn replace_events_for_signature(
        &self,
        signature: &str,
        events: &[CanonicalEvent],
    ) -> Result<usize> {
        self.backend
            .replace_events_for_signature(signature, events)
            .await
    }

    pub async fn get_events_by_signature(&self, signature: &str) -> Result<Vec<EventRecord>> {
        self.backend.get_events_by_signature(signature).await
    }

    pub async fn list_recent_transactions(&self, limit: usize) -> Result<Vec<TransactionSummary>> {
        self.backend.list_recent_transactions(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_limit_is_clamped() {
        let mut query = LogEventQuery::default();
        assert_eq!(query.effective_limit(), 50);
        query.limit = Some(0);
        assert_eq!(query.effective_limit(), 1);
        query.limit = Some(10_000);
        assert_eq!(query.effective_limit(), 500);
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        let query = LogEventQuery {
            program_contains: Some(" 50%_off ".into()),
            ..Default::default()
        };
        assert_eq!(query.like_pattern().as_deref(), Some("%50\\%\\_off%"));

        let blank = LogEventQuery {
            program_contains: Some("   ".into()),
            ..Default::default()
        };
        assert!(blank.like_pattern().is_none());
    }

    #[test]
    fn test_row_from_record_drops_empty_logs() {
        let record = LogRecord {
            slot: 9,
            signature: "sig".into(),
            err: None,
            logs: vec![],
            ts: None,
        };
        let row = LogEventRow::from_record(&record);
        assert_eq!(row.slot, 9);
        assert!(row.logs.is_none());
        assert!(row.err.is_none());
    }
}
