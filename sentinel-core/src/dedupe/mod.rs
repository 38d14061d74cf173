use crate::clock::{Clock, TokioClock};
use crate::config::{DedupeConfig, IdentityShape};
use crate::error::{Result, SentinelError};
use crate::metrics::Metrics;
use crate::retry::Retry;
use crate::types::Slot;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub mod memory;
pub mod redis;

pub use memory::MemoryDedupeStore;
pub use self::redis::RedisDedupeStore;

/// Key/value store able to set a key only when it is absent.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Set `key` with expiry `ttl` unless it already exists.
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Identity of an occurrence, rendered under the guard's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeKey<'a> {
    Signature(&'a str),
    SignatureSlot(&'a str, Slot),
    /// Per-subscription marker for the live path.
    Live {
        subscription: &'a str,
        signature: &'a str,
    },
}

impl<'a> DedupeKey<'a> {
    pub fn for_identity(shape: IdentityShape, signature: &'a str, slot: Slot) -> Self {
        match shape {
            IdentityShape::Signature => DedupeKey::Signature(signature),
            IdentityShape::SignatureSlot => DedupeKey::SignatureSlot(signature, slot),
        }
    }

    pub fn render(&self, namespace: &str) -> String {
        match self {
            DedupeKey::Signature(sig) => format!("{}:{}", namespace, sig),
            DedupeKey::SignatureSlot(sig, slot) => format!("{}:{}:{}", namespace, sig, slot),
            DedupeKey::Live {
                subscription,
                signature,
            } => format!("{}:live:{}:{}", namespace, subscription, signature),
        }
    }
}

/// Suppresses repeated occurrences of the same key within a TTL window.
///
/// Store faults are retried under the configured policy. Once the budget is
/// spent the guard answers `false`, so an unreachable store suppresses
/// events instead of letting duplicates through.
#[derive(Clone)]
pub struct DedupeGuard {
    store: Arc<dyn DedupeStore>,
    config: DedupeConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl DedupeGuard {
    pub fn new(store: Arc<dyn DedupeStore>, config: DedupeConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(TokioClock),
            metrics,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// `true` when this is the first sighting of `key` within `ttl`.
    pub async fn try_accept(&self, key: &DedupeKey<'_>, ttl: Duration) -> bool {
        let rendered = key.render(&self.config.namespace);
        let ttl = ttl.max(Duration::from_millis(1));
        let retry = Retry::new(self.config.retry.clone()).with_clock(self.clock.clone());

        let outcome = retry
            .run(|_| {
                let rendered = rendered.as_str();
                async move {
                    let result = tokio::time::timeout(
                        self.config.op_timeout,
                        self.store.set_if_absent(rendered, ttl),
                    )
                    .await;

                    match result {
                        Ok(Ok(accepted)) => Ok(accepted),
                        Ok(Err(e)) => {
                            Metrics::incr(&self.metrics.dedupe_errors);
                            Err(SentinelError::StoreUnavailable(e.to_string()))
                        }
                        Err(_) => {
                            Metrics::incr(&self.metrics.dedupe_errors);
                            Err(SentinelError::StoreUnavailable(format!(
                                "dedupe store timed out after {:?}",
                                self.config.op_timeout
                            )))
                        }
                    }
                }
            })
            .await;

        match outcome {
            Ok(accepted) => {
                if !accepted {
                    debug!("Duplicate suppressed: {}", rendered);
                }
                accepted
            }
            Err(e) => {
                Metrics::incr(&self.metrics.dedupe_exhausted);
                error!("Dedupe check for {} gave up, dropping event: {}", rendered, e);
                false
            }
        }
    }
}
