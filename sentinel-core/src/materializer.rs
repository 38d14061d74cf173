use crate::config::MaterializerConfig;
use crate::db::{Database, LogEventRow};
use crate::error::Result;
use crate::eventlog::{Cursor, EventLog, LogEntry};
use crate::metrics::Metrics;
use crate::record::LogRecord;
use crate::types::LogId;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one read-and-apply pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing new in the log.
    Idle,
    /// Entries consumed (applied or skipped); the count is rows upserted.
    Progressed(usize),
    /// The store is unreachable; the cursor did not move.
    StoreUnavailable,
    /// A record failed to write and will be retried.
    Stalled,
}

/// Projects the durable log into `tx_events`, one upsert per entry, in log order.
///
/// The cursor only moves past an entry once its row is committed, it is
/// malformed, or it has failed `max_record_attempts` times. Entries read but
/// not yet applied are held until they are, so a retry never depends on
/// re-reading from a relative cursor such as `$`.
pub struct Materializer {
    log: Arc<dyn EventLog>,
    db: Database,
    config: MaterializerConfig,
    metrics: Arc<Metrics>,
    cursor: Cursor,
    pending: VecDeque<LogEntry>,
    failing: Option<(LogId, u32)>,
}

impl Materializer {
    pub fn new(
        log: Arc<dyn EventLog>,
        db: Database,
        config: MaterializerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cursor = Cursor::from(&config.start);
        Self {
            log,
            db,
            config,
            metrics,
            cursor,
            pending: VecDeque::new(),
            failing: None,
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!("Materializer starting from {}", self.cursor);

        loop {
            let pass = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pass = self.run_once() => pass,
            };

            let pause = match pass {
                Ok(PassOutcome::StoreUnavailable) | Ok(PassOutcome::Stalled) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!("Reading the event log failed: {}", e);
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_backoff) => {}
                }
            }
        }

        info!("Materializer stopped at {}", self.cursor);
        Ok(())
    }

    /// Apply held entries, or read one batch after the cursor, in order.
    pub async fn run_once(&mut self) -> Result<PassOutcome> {
        if self.pending.is_empty() {
            let entries = self
                .log
                .read_since(&self.cursor, self.config.batch_size, self.config.block_for)
                .await?;
            if entries.is_empty() {
                return Ok(PassOutcome::Idle);
            }
            self.pending.extend(entries);
        }

        let mut applied = 0;
        while let Some(entry) = self.pending.pop_front() {
            let record = match LogRecord::from_fields(&entry.fields) {
                Ok(record) => record,
                Err(e) => {
                    Metrics::incr(&self.metrics.malformed_records);
                    warn!("Skipping malformed entry {}: {}", entry.id, e);
                    self.cursor.advance_to(&entry.id);
                    continue;
                }
            };

            match self.db.upsert_log_event(&LogEventRow::from_record(&record)).await {
                Ok(()) => {
                    self.metrics.record_db_upsert(false);
                    debug!("Materialized {} at slot {}", record.signature, record.slot);
                    self.failing = None;
                    self.cursor.advance_to(&entry.id);
                    applied += 1;
                }
                Err(e) if e.is_store_unavailable() => {
                    self.metrics.record_db_upsert(true);
                    warn!("Store unavailable at {}: {}", entry.id, e);
                    self.pending.push_front(entry);
                    return Ok(PassOutcome::StoreUnavailable);
                }
                Err(e) => {
                    self.metrics.record_db_upsert(true);
                    let attempts = self.note_failure(&entry.id);
                    if attempts >= self.config.max_record_attempts {
                        Metrics::incr(&self.metrics.lost_records);
                        error!(
                            "Giving up on entry {} ({}) after {} attempts: {}",
                            entry.id, record.signature, attempts, e
                        );
                        self.failing = None;
                        self.cursor.advance_to(&entry.id);
                        continue;
                    }
                    warn!(
                        "Upsert of {} failed (attempt {}/{}): {}",
                        record.signature, attempts, self.config.max_record_attempts, e
                    );
                    self.pending.push_front(entry);
                    return Ok(PassOutcome::Stalled);
                }
            }
        }

        Ok(PassOutcome::Progressed(applied))
    }

    fn note_failure(&mut self, id: &str) -> u32 {
        let attempts = match &self.failing {
            Some((failing_id, attempts)) if failing_id == id => attempts + 1,
            _ => 1,
        };
        self.failing = Some((id.to_string(), attempts));
        attempts
    }
}
