use super::DedupeStore;
use crate::clock::{Clock, TokioClock};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Inserts between full sweeps of expired keys.
const SWEEP_EVERY: usize = 1024;

#[derive(Default)]
struct Entries {
    expiries: HashMap<String, Instant>,
    inserts_since_sweep: usize,
}

/// In-process dedupe store with per-key expiry.
///
/// Expired keys are treated as absent on lookup and physically removed by a
/// sweep that runs once every `sweep_every` inserts.
pub struct MemoryDedupeStore {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
    sweep_every: usize,
}

impl MemoryDedupeStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
            sweep_every: SWEEP_EVERY,
        }
    }

    pub fn with_sweep_every(mut self, inserts: usize) -> Self {
        self.sweep_every = inserts.max(1);
        self
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .map(|entries| entries.expiries.values().filter(|expiry| **expiry > now).count())
            .unwrap_or(0)
    }

    /// Keys held in memory, expired or not.
    #[cfg(test)]
    fn retained(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.expiries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDedupeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupeStore for MemoryDedupeStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        if entries.expiries.get(key).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }

        entries.inserts_since_sweep += 1;
        if entries.inserts_since_sweep >= self.sweep_every {
            entries.expiries.retain(|_, expiry| *expiry > now);
            entries.inserts_since_sweep = 0;
        }
        entries.expiries.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_expired_keys_are_purged() {
        let clock = ManualClock::new();
        let store = MemoryDedupeStore::with_clock(Arc::new(clock.clone()));

        assert!(store.set_if_absent("a", Duration::from_secs(1)).await.unwrap());
        assert!(store.set_if_absent("b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.len(), 1);
        assert!(store.set_if_absent("a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_runs_every_n_inserts() {
        let clock = ManualClock::new();
        let store = MemoryDedupeStore::with_clock(Arc::new(clock.clone())).with_sweep_every(3);

        assert!(store.set_if_absent("a", Duration::from_secs(1)).await.unwrap());
        assert!(store.set_if_absent("b", Duration::from_secs(1)).await.unwrap());
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.len(), 0);
        assert_eq!(store.retained(), 2);

        // Third insert sweeps the expired "b"; "a" is written back fresh.
        assert!(store.set_if_absent("a", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.retained(), 1);

        assert!(!store.set_if_absent("a", Duration::from_secs(10)).await.unwrap());
        assert!(store.set_if_absent("c", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.retained(), 2);
        assert_eq!(store.len(), 2);
    }
}
