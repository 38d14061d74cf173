use crate::config::FanoutConfig;
use crate::dedupe::{DedupeGuard, DedupeKey};
use crate::error::{Result, SentinelError};
use crate::metrics::Metrics;
use crate::types::{CanonicalEvent, EventKind, Slot};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// In-process broadcast of canonical events to live subscriptions.
#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<CanonicalEvent>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of subscriptions that will see the event.
    pub fn publish(&self, event: CanonicalEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanonicalEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Subscription filter. Empty sets match everything; an event without an
/// account (or program) never matches a non-empty account (or program) set.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub accounts: HashSet<String>,
    pub programs: HashSet<String>,
}

impl EventFilter {
    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_accounts<I: IntoIterator<Item = String>>(mut self, accounts: I) -> Self {
        self.accounts.extend(accounts);
        self
    }

    pub fn with_programs<I: IntoIterator<Item = String>>(mut self, programs: I) -> Self {
        self.programs.extend(programs);
        self
    }

    pub fn matches(&self, event: &CanonicalEvent) -> bool {
        if self.kind.is_some_and(|kind| kind != event.kind) {
            return false;
        }
        if !self.accounts.is_empty()
            && !event.account.as_ref().is_some_and(|a| self.accounts.contains(a))
        {
            return false;
        }
        if !self.programs.is_empty()
            && !event.program.as_ref().is_some_and(|p| self.programs.contains(p))
        {
            return false;
        }
        true
    }
}

/// Event as delivered to a live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    pub id: String,
    pub kind: EventKind,
    pub slot: Slot,
    pub account: Option<String>,
    pub program: Option<String>,
    /// JSON encoding of the canonical event.
    pub payload: Vec<u8>,
    pub ts_ms: i64,
}

impl LiveEvent {
    pub fn from_event(event: &CanonicalEvent) -> Result<Self> {
        Ok(Self {
            id: event.id(),
            kind: event.kind,
            slot: event.slot,
            account: event.account.clone(),
            program: event.program.clone(),
            payload: serde_json::to_vec(event)?,
            ts_ms: event.occurred_at.timestamp_millis(),
        })
    }
}

/// Destination of a live subscription.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: LiveEvent) -> Result<()>;
}

/// Forwards into an mpsc channel; fails once the receiver is gone.
pub struct ChannelSink {
    tx: mpsc::Sender<LiveEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<LiveEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: LiveEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SentinelError::Transport("live subscriber disconnected".to_string()))
    }
}

/// Logs every delivered event.
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl EventSink for TracingSink {
    async fn send(&mut self, event: LiveEvent) -> Result<()> {
        info!(
            "[{}] {} slot={} account={} program={} id={}",
            self.label,
            event.kind,
            event.slot,
            event.account.as_deref().unwrap_or("-"),
            event.program.as_deref().unwrap_or("-"),
            event.id
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Queued,
    Filtered,
    Duplicate,
    Dropped,
}

/// Producer half of a subscription: filter, dedupe, enqueue without blocking.
pub struct Emitter {
    subscription: String,
    filter: EventFilter,
    guard: DedupeGuard,
    dedupe_ttl: Duration,
    queue: mpsc::Sender<LiveEvent>,
    metrics: Arc<Metrics>,
}

impl Emitter {
    pub fn new(
        subscription: impl Into<String>,
        filter: EventFilter,
        guard: DedupeGuard,
        dedupe_ttl: Duration,
        queue: mpsc::Sender<LiveEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            filter,
            guard,
            dedupe_ttl,
            queue,
            metrics,
        }
    }

    pub async fn emit(&self, event: &CanonicalEvent) -> EmitOutcome {
        if !self.filter.matches(event) {
            return EmitOutcome::Filtered;
        }

        let key = DedupeKey::Live {
            subscription: &self.subscription,
            signature: &event.signature,
        };
        if !self.guard.try_accept(&key, self.dedupe_ttl).await {
            Metrics::incr(&self.metrics.live_deduped);
            return EmitOutcome::Duplicate;
        }

        let live = match LiveEvent::from_event(event) {
            Ok(live) => live,
            Err(e) => {
                warn!("Cannot encode {} for {}: {}", event.signature, self.subscription, e);
                Metrics::incr(&self.metrics.live_dropped);
                return EmitOutcome::Dropped;
            }
        };

        match self.queue.try_send(live) {
            Ok(()) => EmitOutcome::Queued,
            Err(TrySendError::Full(dropped)) => {
                Metrics::incr(&self.metrics.live_dropped);
                debug!("Queue full for {}, dropped {}", self.subscription, dropped.id);
                EmitOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => EmitOutcome::Dropped,
        }
    }
}

/// Serves live subscriptions off a [`LiveHub`].
pub struct Fanout {
    hub: LiveHub,
    guard: DedupeGuard,
    config: FanoutConfig,
    metrics: Arc<Metrics>,
    instance: i64,
    next_subscription: AtomicU64,
}

impl Fanout {
    pub fn new(hub: LiveHub, guard: DedupeGuard, config: FanoutConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            hub,
            guard,
            config,
            metrics,
            instance: chrono::Utc::now().timestamp_millis(),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn hub(&self) -> &LiveHub {
        &self.hub
    }

    /// Stream matching events into `sink` until `cancel` fires or a send fails.
    ///
    /// On cancellation whatever is already queued is still delivered before
    /// returning `Ok(())`. A sink error, or a send that does not complete
    /// within `send_timeout`, stops the subscription and is returned.
    pub async fn serve<S>(&self, filter: EventFilter, sink: &mut S, cancel: CancellationToken) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        let subscription = format!(
            "{}-{}",
            self.instance,
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let (queue_tx, mut queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let producer_cancel = cancel.child_token();
        let mut hub_rx = self.hub.subscribe();
        let emitter = Emitter::new(
            subscription.clone(),
            filter,
            self.guard.clone(),
            self.config.dedupe_ttl,
            queue_tx,
            self.metrics.clone(),
        );
        let metrics = self.metrics.clone();
        let stop = producer_cancel.clone();

        info!("Live subscription {} opened", subscription);

        let producer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    received = hub_rx.recv() => match received {
                        Ok(event) => {
                            tokio::select! {
                                biased;
                                _ = stop.cancelled() => break,
                                _ = emitter.emit(&event) => {}
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            metrics.live_dropped.fetch_add(missed, Ordering::Relaxed);
                            warn!("Subscription lagged behind the hub, {} events dropped", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    producer_cancel.cancel();
                    break self.drain(&mut queue_rx, sink, &subscription).await;
                }
                event = queue_rx.recv() => match event {
                    Some(event) => event,
                    None => break Ok(()),
                },
            };
            if let Err(e) = self.deliver(sink, event, &subscription).await {
                break Err(e);
            }
        };

        producer_cancel.cancel();
        let _ = producer.await;
        info!("Live subscription {} closed", subscription);
        result
    }

    /// Deliver what is already queued once the subscription is cancelled.
    async fn drain<S>(
        &self,
        queue_rx: &mut mpsc::Receiver<LiveEvent>,
        sink: &mut S,
        subscription: &str,
    ) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        queue_rx.close();
        while let Ok(event) = queue_rx.try_recv() {
            self.deliver(sink, event, subscription).await?;
        }
        Ok(())
    }

    async fn deliver<S>(&self, sink: &mut S, event: LiveEvent, subscription: &str) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        let kind = event.kind;
        let sent = match tokio::time::timeout(self.config.send_timeout, sink.send(event)).await {
            Ok(sent) => sent,
            Err(_) => Err(SentinelError::Transport(format!(
                "sink did not accept an event within {:?}",
                self.config.send_timeout
            ))),
        };
        match sent {
            Ok(()) => {
                self.metrics.record_live_emit(kind.as_str());
                Ok(())
            }
            Err(e) => {
                Metrics::incr(&self.metrics.stream_errors);
                warn!("Live subscription {} send failed: {}", subscription, e);
                Err(e)
            }
        }
    }
}
