use super::{Cursor, EventLog, LogEntry};
use crate::error::{Result, SentinelError};
use crate::record::LogRecord;
use crate::types::LogId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    entries: VecDeque<(u64, HashMap<String, String>)>,
    last_seq: u64,
}

/// In-process event log with `<seq>-0` IDs and a bounded retention window.
pub struct MemoryEventLog {
    state: Mutex<State>,
    appended: Notify,
    max_len: usize,
}

impl MemoryEventLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            max_len: max_len.max(1),
        }
    }

    /// Append raw fields, as a foreign producer would.
    pub fn append_fields(&self, fields: HashMap<String, String>) -> LogId {
        let seq = {
            let mut state = self.lock();
            state.last_seq += 1;
            let seq = state.last_seq;
            state.entries.push_back((seq, fields));
            while state.entries.len() > self.max_len {
                state.entries.pop_front();
            }
            seq
        };
        self.appended.notify_waiters();
        format!("{}-0", seq)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn parse_seq(id: &str) -> Result<u64> {
        id.split('-')
            .next()
            .and_then(|seq| seq.parse().ok())
            .ok_or_else(|| SentinelError::Protocol(format!("invalid log ID '{}'", id)))
    }

    fn collect_after(&self, after: u64, max_count: usize) -> Vec<LogEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(max_count)
            .map(|(seq, fields)| LogEntry {
                id: format!("{}-0", seq),
                fields: fields.clone(),
            })
            .collect()
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, record: &LogRecord) -> Result<LogId> {
        let fields = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Ok(self.append_fields(fields))
    }

    async fn read_since(
        &self,
        cursor: &Cursor,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<LogEntry>> {
        let after = match cursor {
            Cursor::Beginning => 0,
            Cursor::Latest => self.lock().last_seq,
            Cursor::After(id) => Self::parse_seq(id)?,
        };
        let max_count = max_count.max(1);
        let deadline = tokio::time::Instant::now() + block_for;

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect_after(after, max_count);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(signature: &str, slot: u64) -> LogRecord {
        LogRecord {
            slot,
            signature: signature.to_string(),
            err: None,
            logs: vec![],
            ts: None,
        }
    }

    #[tokio::test]
    async fn test_read_since_is_exclusive_and_ordered() {
        let log = MemoryEventLog::default();
        let first = log.append(&record("a", 1)).await.unwrap();
        log.append(&record("b", 2)).await.unwrap();
        log.append(&record("c", 3)).await.unwrap();

        let all = log
            .read_since(&Cursor::Beginning, 10, Duration::ZERO)
            .await
            .unwrap();
        let sigs: Vec<_> = all.iter().map(|e| e.fields["signature"].clone()).collect();
        assert_eq!(sigs, vec!["a", "b", "c"]);

        let rest = log
            .read_since(&Cursor::After(first), 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].fields["signature"], "b");
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let log = std::sync::Arc::new(MemoryEventLog::default());
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.append(&record("late", 5)).await.unwrap();
        });

        let batch = log
            .read_since(&Cursor::Latest, 10, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields["signature"], "late");
    }

    #[tokio::test]
    async fn test_empty_read_times_out() {
        let log = MemoryEventLog::default();
        let batch = log
            .read_since(&Cursor::Beginning, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_retention_is_bounded() {
        let log = MemoryEventLog::new(2);
        for (i, sig) in ["a", "b", "c"].iter().enumerate() {
            log.append(&record(sig, i as u64)).await.unwrap();
        }
        assert_eq!(log.len(), 2);
        let batch = log
            .read_since(&Cursor::Beginning, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].id, "2-0");
    }
}
