use crate::clock::{Clock, TokioClock};
use crate::error::{Result, SentinelError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// `base * (attempt + 1)`
    Linear,
    /// `base * multiplier^attempt`
    Exponential(u32),
}

/// Retry policy consumed by [`Retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub growth: Growth,
    pub max_delay: Duration,
    /// Total time budget; a retry whose delay would overrun it is not taken.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn linear(max_retries: u32, unit: Duration) -> Self {
        Self {
            max_retries,
            base_delay: unit,
            growth: Growth::Linear,
            max_delay: unit.saturating_mul(max_retries.max(1)),
            max_elapsed: None,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay,
            growth: Growth::Exponential(2),
            max_delay,
            max_elapsed: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = match self.growth {
            Growth::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            Growth::Exponential(multiplier) => self
                .base_delay
                .saturating_mul(multiplier.saturating_pow(attempt)),
        };
        raw.min(self.max_delay)
    }
}

/// Runs an async operation under a [`RetryPolicy`].
///
/// Only errors for which [`SentinelError::is_retryable`] holds are retried.
/// With a cancellation token attached, both the operation and the backoff
/// wait are abandoned as soon as the token fires.
#[derive(Clone)]
pub struct Retry {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: Option<CancellationToken>,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            clock: Arc::new(TokioClock),
            cancel: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, passing it the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = self.clock.now();
        let mut attempt = 0u32;

        loop {
            let outcome = match &self.cancel {
                Some(cancel) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SentinelError::Cancelled),
                        outcome = operation(attempt) => outcome,
                    }
                }
                None => operation(attempt).await,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.policy.max_retries {
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt);
            if let Some(budget) = self.policy.max_elapsed {
                let spent = self.clock.now().saturating_duration_since(started);
                if spent + delay > budget {
                    debug!("Retry budget of {:?} exhausted after {} attempt(s)", budget, attempt + 1);
                    return Err(err);
                }
            }

            warn!(
                "Operation failed (attempt {}): {}. Retrying in {:?}...",
                attempt + 1,
                err,
                delay
            );

            self.pause(delay).await?;
            attempt += 1;
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SentinelError::Cancelled),
                    _ = self.clock.sleep(delay) => Ok(()),
                }
            }
            None => {
                self.clock.sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Doubling delay sequence bounded by a ceiling, resettable to its floor.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Process items concurrently with a limit on the number of concurrent operations
pub async fn concurrent_process<T, R, E, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    processor: F,
) -> Vec<std::result::Result<R, E>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    use futures::stream::{self, StreamExt};

    stream::iter(items)
        .map(|item| processor(item))
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manual(policy: RetryPolicy) -> (Retry, ManualClock) {
        let clock = ManualClock::new();
        let retry = Retry::new(policy).with_clock(Arc::new(clock.clone()));
        (retry, clock)
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(400));
        assert_eq!(policy.delay_for(0), Duration::from_millis(400));
        assert_eq!(policy.delay_for(1), Duration::from_millis(800));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1200));
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let (retry, clock) = manual(RetryPolicy::linear(3, Duration::from_millis(400)));

        let result = retry
            .run(|_| async {
                let current = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if current < 3 {
                    Err(SentinelError::Transport("not yet".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(400), Duration::from_millis(800)]
        );
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_retries() {
        let attempts = AtomicU32::new(0);
        let (retry, _clock) = manual(RetryPolicy::linear(2, Duration::from_millis(10)));

        let result: Result<()> = retry
            .run(|_| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SentinelError::Transport("always fails".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let (retry, clock) = manual(RetryPolicy::linear(3, Duration::from_millis(10)));

        let result: Result<()> = retry
            .run(|_| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SentinelError::RemoteRejection {
                    code: -32000,
                    message: "nope".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(SentinelError::RemoteRejection { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_elapsed_budget_limits_attempts() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1))
            .with_max_elapsed(Duration::from_secs(2));
        let (retry, clock) = manual(policy);

        let result: Result<()> = retry
            .run(|_| async { Err(SentinelError::StoreUnavailable("down".into())) })
            .await;

        assert!(result.is_err());
        // 100 + 200 + 400 + 800 = 1500ms; the next 1s wait would overrun 2s.
        assert_eq!(clock.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let retry = Retry::new(RetryPolicy::linear(3, Duration::from_secs(30)))
            .with_cancel(cancel.clone());

        let handle = tokio::spawn(async move {
            retry
                .run(|_| async { Err::<(), _>(SentinelError::Transport("down".into())) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SentinelError::Cancelled)));
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_concurrent_process_keeps_order() {
        let items: Vec<i32> = (0..10).collect();

        let results = concurrent_process(items, 3, |item| async move { Ok::<i32, &str>(item * 2) }).await;

        let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }
}
