//! Retry strategies and the `RetryContext` that walks one (spec.md §4.7).
//!
//! `RetryPolicy`'s delay math is lifted nearly verbatim from the teacher's
//! `reliability::retry::RetryPolicy`; `RetryStrategy` generalizes it into the
//! explicit variants spec.md names instead of the teacher's single
//! exponential-only struct.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::deadline::remaining_deadline;

/// One of the four retry shapes spec.md §4.7 names. Each produces a lazy
/// sequence of delays consulted by [`RetryContext::next_delay`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    NoRetry,
    ConstantBackoff {
        #[serde(with = "duration_millis")]
        delay: Duration,
        max_retries: u32,
    },
    LinearBackoff {
        #[serde(with = "duration_millis")]
        base: Duration,
        #[serde(with = "duration_millis")]
        increment: Duration,
        max_retries: u32,
    },
    ExponentialBackoff {
        #[serde(with = "duration_millis")]
        base: Duration,
        multiplier: f64,
        max_retries: u32,
        #[serde(with = "duration_millis")]
        max_delay: Duration,
        jitter: bool,
    },
}

impl RetryStrategy {
    /// The number of retries this strategy allows (spec.md §4.7: `max` is
    /// the length of the emitted delay sequence, not a count of attempts).
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NoRetry => 0,
            Self::ConstantBackoff { max_retries, .. }
            | Self::LinearBackoff { max_retries, .. }
            | Self::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Delay before retry number `retry_num` (1-based: the delay before the
    /// *first* retry, after the initial attempt has already failed).
    pub fn delay_for_retry(&self, retry_num: u32) -> Duration {
        match self {
            Self::NoRetry => Duration::ZERO,
            Self::ConstantBackoff { delay, .. } => *delay,
            Self::LinearBackoff { base, increment, .. } => {
                *base + *increment * (retry_num.saturating_sub(1))
            }
            Self::ExponentialBackoff {
                base,
                multiplier,
                max_delay,
                jitter,
                ..
            } => {
                let raw = base.as_secs_f64() * multiplier.powi(retry_num.saturating_sub(1) as i32);
                let capped = raw.min(max_delay.as_secs_f64());
                let scaled = if *jitter {
                    let factor = rand::thread_rng().gen_range(0.5..1.5);
                    capped * factor
                } else {
                    capped
                };
                Duration::from_secs_f64(scaled.max(0.0))
            }
        }
    }
}

/// Convenience presets mirroring the teacher's `RetryPolicy::exponential()` /
/// `no_retry()` / `fixed()` constructors, expressed as [`RetryStrategy`]
/// values.
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn no_retry() -> RetryStrategy {
        RetryStrategy::NoRetry
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> RetryStrategy {
        RetryStrategy::ConstantBackoff { delay, max_retries }
    }

    pub fn exponential() -> RetryStrategy {
        RetryStrategy::ExponentialBackoff {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 5,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Tracks a single operation's retry state: how many times it has failed,
/// and whether/how long to wait before the next attempt. Per §9's resolved
/// Open Question, `attempt` increments monotonically across every retry
/// path, including DLQ-originated retries.
///
/// `attempt` counts failed calls, 1-based: it reaches 0 only before the
/// first call. Because the strategy's `max_retries` is the number of
/// *retries* (spec.md §4.7), not the number of attempts, `should_retry`
/// compares against it directly rather than against `max_retries + 1` —
/// an `ExponentialBackoff { max_retries: 3, .. }` runs the initial call plus
/// exactly 3 retries, leaving `attempt() == 4` once exhausted (spec.md §8
/// scenario 2).
#[derive(Debug, Clone)]
pub struct RetryContext {
    strategy: RetryStrategy,
    attempt: u32,
}

impl RetryContext {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt, advancing the internal counter.
    pub fn record_failure(&mut self) {
        self.attempt += 1;
    }

    pub fn should_retry(&self) -> bool {
        self.attempt <= self.strategy.max_retries()
    }

    /// The delay before the next attempt, i.e. the `attempt`-th retry
    /// (1-based: called right after `record_failure`, so `attempt` is
    /// already the number of the retry about to run).
    pub fn next_delay(&self) -> Duration {
        self.strategy.delay_for_retry(self.attempt)
    }
}

/// The outcome of a [`with_retry`] loop that never succeeded.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Debug> {
    #[error("retries exhausted after {attempts} attempt(s): {last_error:?}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("aborting retry: only {remaining:?} left on the enclosing deadline, next delay is {next_delay:?}")]
    DeadlineInsufficient {
        last_error: E,
        remaining: Duration,
        next_delay: Duration,
    },
}

/// Drives `operation` through `strategy`'s retry loop: call, and on failure
/// record it, check whether another attempt is allowed, sleep for the
/// strategy's delay, and retry (spec.md §4.7). Honors any enclosing
/// [`super::deadline::with_deadline`] scope: if the remaining budget can't
/// cover the next delay, the loop aborts early with the last error instead
/// of sleeping past the deadline.
pub async fn with_retry<F, Fut, T, E>(strategy: RetryStrategy, mut operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut ctx = RetryContext::new(strategy);
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                ctx.record_failure();
                if !ctx.should_retry() {
                    return Err(RetryError::Exhausted {
                        attempts: ctx.attempt(),
                        last_error: err,
                    });
                }

                let next_delay = ctx.next_delay();
                if let Some(remaining) = remaining_deadline() {
                    if remaining < next_delay {
                        return Err(RetryError::DeadlineInsufficient {
                            last_error: err,
                            remaining,
                            next_delay,
                        });
                    }
                }

                tokio::time::sleep(next_delay).await;
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_never_retries() {
        let mut ctx = RetryContext::new(RetryStrategy::NoRetry);
        ctx.record_failure();
        assert!(!ctx.should_retry());
    }

    #[test]
    fn constant_backoff_uses_fixed_delay() {
        let strategy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        assert_eq!(strategy.delay_for_retry(1), Duration::from_secs(5));
        assert_eq!(strategy.delay_for_retry(2), Duration::from_secs(5));
    }

    #[test]
    fn linear_backoff_increments_each_retry() {
        let strategy = RetryStrategy::LinearBackoff {
            base: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_retries: 5,
        };
        assert_eq!(strategy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(strategy.delay_for_retry(2), Duration::from_secs(3));
        assert_eq!(strategy.delay_for_retry(3), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_without_jitter_doubles_each_retry() {
        let strategy = RetryStrategy::ExponentialBackoff {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 5,
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(strategy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(strategy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(strategy.delay_for_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn exponential_backoff_caps_at_max_delay() {
        let strategy = RetryStrategy::ExponentialBackoff {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 10,
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(strategy.delay_for_retry(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_transient_failures() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let strategy = RetryPolicy::fixed(Duration::from_millis(1), 5);
        let result: Result<&str, RetryError<&str>> = with_retry(strategy, || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok("done") } }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_max_retries() {
        // 3 retries means 4 total calls (1 initial + 3 retries).
        let strategy = RetryPolicy::fixed(Duration::from_millis(1), 3);
        let result: Result<(), RetryError<&str>> = with_retry(strategy, || async { Err("nope") }).await;
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "nope");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    /// Spec scenario 2 (spec.md §8): `ExponentialBackoff(base=1, max=3,
    /// multiplier=2, jitter=false)` must emit delays `[1s, 2s, 4s]` and
    /// report `attempt=4` on exhaustion. Runs with tokio's paused virtual
    /// clock so the assertion on total elapsed delay doesn't cost 7 real
    /// seconds.
    #[tokio::test(start_paused = true)]
    async fn with_retry_reproduces_spec_scenario_two() {
        let strategy = RetryStrategy::ExponentialBackoff {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 3,
            max_delay: Duration::from_secs(60),
            jitter: false,
        };

        let started = tokio::time::Instant::now();
        let result: Result<(), RetryError<&str>> = with_retry(strategy, || async { Err("transient") }).await;

        match result.unwrap_err() {
            RetryError::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "transient");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // 1s + 2s + 4s, matching the scenario's delay sequence exactly.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn with_retry_aborts_early_when_the_deadline_cannot_cover_the_next_delay() {
        let strategy = RetryPolicy::fixed(Duration::from_secs(30), 5);
        let result: Result<(), RetryError<&str>> = crate::resilience::with_deadline(0, "budget", async {
            with_retry(strategy, || async { Err("nope") }).await
        })
        .await;
        assert!(matches!(result.unwrap_err(), RetryError::DeadlineInsufficient { .. }));
    }

    #[test]
    fn retry_context_tracks_attempts_monotonically() {
        let mut ctx = RetryContext::new(RetryPolicy::fixed(Duration::from_millis(10), 3));
        assert_eq!(ctx.attempt(), 0);
        ctx.record_failure();
        assert_eq!(ctx.attempt(), 1);
        assert!(ctx.should_retry());
        ctx.record_failure();
        assert_eq!(ctx.attempt(), 2);
        assert!(ctx.should_retry());
        ctx.record_failure();
        assert_eq!(ctx.attempt(), 3);
        assert!(ctx.should_retry());
        ctx.record_failure();
        assert_eq!(ctx.attempt(), 4);
        assert!(!ctx.should_retry());
    }
}
