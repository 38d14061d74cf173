use crate::config::IngestConfig;
use crate::dedupe::{DedupeGuard, DedupeKey};
use crate::eventlog::EventLog;
use crate::fanout::LiveHub;
use crate::metrics::Metrics;
use crate::normalize::events_from_notification;
use crate::record::LogRecord;
use crate::retry::Retry;
use crate::types::{LogId, RawNotification};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No signature to key on.
    Skipped,
    Duplicate,
    Published(LogId),
    Failed,
}

/// Turns watcher notifications into durable log records.
///
/// Every notification with a signature reaches the live hub; only the
/// first sighting of its identity within the dedupe TTL is appended.
pub struct Ingestor {
    log: Arc<dyn EventLog>,
    guard: DedupeGuard,
    hub: Option<LiveHub>,
    config: IngestConfig,
    metrics: Arc<Metrics>,
}

impl Ingestor {
    pub fn new(
        log: Arc<dyn EventLog>,
        guard: DedupeGuard,
        config: IngestConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            log,
            guard,
            hub: None,
            config,
            metrics,
        }
    }

    pub fn with_hub(mut self, hub: LiveHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub async fn handle(&self, notification: RawNotification) -> IngestOutcome {
        Metrics::incr(&self.metrics.notifications_ingested);

        if notification.signature.trim().is_empty() {
            debug!("Skipping notification without signature at slot {}", notification.slot);
            return IngestOutcome::Skipped;
        }

        let received_at = Utc::now();
        if let Some(hub) = &self.hub {
            for event in events_from_notification(&notification, received_at) {
                hub.publish(event);
            }
        }

        let key = DedupeKey::for_identity(
            self.config.identity,
            &notification.signature,
            notification.slot,
        );
        if !self.guard.try_accept(&key, self.config.dedupe_ttl).await {
            Metrics::incr(&self.metrics.dedupe_dropped);
            return IngestOutcome::Duplicate;
        }

        let record = LogRecord::from_notification(&notification, received_at);
        let retry = Retry::new(self.config.append_retry.clone());
        match retry.run(|_| self.log.append(&record)).await {
            Ok(id) => {
                Metrics::incr(&self.metrics.events_published);
                debug!("Published {} at slot {} as {}", record.signature, record.slot, id);
                IngestOutcome::Published(id)
            }
            Err(e) => {
                Metrics::incr(&self.metrics.publish_failures);
                error!("Failed to append {} to the event log: {}", record.signature, e);
                IngestOutcome::Failed
            }
        }
    }

    /// Consume notifications until the channel closes or `cancel` fires.
    pub async fn run(&self, mut notifications: mpsc::Receiver<RawNotification>, cancel: CancellationToken) {
        loop {
            let notification = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };
            self.handle(notification).await;
        }
        info!("Ingestor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupeConfig, IdentityShape};
    use crate::dedupe::MemoryDedupeStore;
    use crate::error::{Result, SentinelError};
    use crate::eventlog::{Cursor, LogEntry, MemoryEventLog};
    use crate::retry::RetryPolicy;
    use crate::types::EventKind;
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownLog;

    #[async_trait]
    impl EventLog for DownLog {
        async fn append(&self, _record: &LogRecord) -> Result<LogId> {
            Err(SentinelError::StoreUnavailable("connection refused".into()))
        }

        async fn read_since(&self, _: &Cursor, _: usize, _: Duration) -> Result<Vec<LogEntry>> {
            Ok(Vec::new())
        }
    }

    fn notification(signature: &str, slot: u64) -> RawNotification {
        RawNotification {
            slot,
            signature: signature.to_string(),
            err: None,
            logs: vec!["Program Prog1 invoke [1]".into()],
        }
    }

    fn ingestor(log: Arc<dyn EventLog>, identity: IdentityShape, metrics: &Arc<Metrics>) -> Ingestor {
        let guard = DedupeGuard::new(
            Arc::new(MemoryDedupeStore::new()),
            DedupeConfig::default(),
            metrics.clone(),
        );
        let config = IngestConfig {
            identity,
            append_retry: RetryPolicy::linear(2, Duration::from_millis(1)),
            ..IngestConfig::default()
        };
        Ingestor::new(log, guard, config, metrics.clone())
    }

    async fn logged_signatures(log: &MemoryEventLog) -> Vec<(String, String)> {
        log.read_since(&Cursor::Beginning, 100, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.fields["signature"].clone(), e.fields["slot"].clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_repeat_signature_is_appended_once() {
        let log = Arc::new(MemoryEventLog::default());
        let metrics = Metrics::shared();
        let ingestor = ingestor(log.clone(), IdentityShape::Signature, &metrics);

        assert!(matches!(ingestor.handle(notification("sigA", 100)).await, IngestOutcome::Published(_)));
        assert!(matches!(ingestor.handle(notification("sigB", 101)).await, IngestOutcome::Published(_)));
        assert_eq!(ingestor.handle(notification("sigA", 102)).await, IngestOutcome::Duplicate);

        assert_eq!(
            logged_signatures(&log).await,
            vec![("sigA".into(), "100".into()), ("sigB".into(), "101".into())]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.notifications_ingested, 3);
        assert_eq!(snapshot.dedupe_dropped, 1);
        assert_eq!(snapshot.events_published, 2);
    }

    #[tokio::test]
    async fn test_slot_qualified_identity_keeps_each_slot() {
        let log = Arc::new(MemoryEventLog::default());
        let metrics = Metrics::shared();
        let ingestor = ingestor(log.clone(), IdentityShape::SignatureSlot, &metrics);

        ingestor.handle(notification("sigA", 100)).await;
        ingestor.handle(notification("sigA", 102)).await;
        assert_eq!(ingestor.handle(notification("sigA", 102)).await, IngestOutcome::Duplicate);

        assert_eq!(logged_signatures(&log).await.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_signature_is_skipped() {
        let log = Arc::new(MemoryEventLog::default());
        let metrics = Metrics::shared();
        let ingestor = ingestor(log.clone(), IdentityShape::Signature, &metrics);

        assert_eq!(ingestor.handle(notification("", 5)).await, IngestOutcome::Skipped);
        assert!(log.is_empty());
        assert_eq!(metrics.snapshot().notifications_ingested, 1);
    }

    #[tokio::test]
    async fn test_hub_sees_duplicates_of_the_durable_path() {
        let log = Arc::new(MemoryEventLog::default());
        let metrics = Metrics::shared();
        let hub = LiveHub::new(16);
        let mut rx = hub.subscribe();
        let ingestor = ingestor(log, IdentityShape::Signature, &metrics).with_hub(hub);

        ingestor.handle(notification("sigA", 100)).await;
        ingestor.handle(notification("sigA", 102)).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::ProgramLog);
        assert_eq!(first.program.as_deref(), Some("Prog1"));
        assert_eq!((first.slot, second.slot), (100, 102));
    }

    #[tokio::test]
    async fn test_append_failure_is_counted_not_fatal() {
        let metrics = Metrics::shared();
        let ingestor = ingestor(Arc::new(DownLog), IdentityShape::Signature, &metrics);

        assert_eq!(ingestor.handle(notification("sigA", 1)).await, IngestOutcome::Failed);
        assert_eq!(metrics.snapshot().publish_failures, 1);
        assert_eq!(metrics.snapshot().events_published, 0);
    }

    #[tokio::test]
    async fn test_run_drains_channel_until_closed() {
        let log = Arc::new(MemoryEventLog::default());
        let metrics = Metrics::shared();
        let ingestor = ingestor(log.clone(), IdentityShape::Signature, &metrics);
        let (tx, rx) = mpsc::channel(4);

        tx.send(notification("sigA", 1)).await.unwrap();
        tx.send(notification("sigB", 2)).await.unwrap();
        drop(tx);

        ingestor.run(rx, CancellationToken::new()).await;
        assert_eq!(log.len(), 2);
    }
}
