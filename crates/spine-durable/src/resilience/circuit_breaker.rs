//! Circuit breaker (spec.md §4.7): per key, `{closed, open, half_open}` with
//! failure-threshold/cooldown transitions.
//!
//! `CircuitState`/`CircuitBreakerConfig` are lifted from the teacher's
//! `reliability::circuit_breaker` almost verbatim. The transition rules below
//! follow the teacher's `reliability::distributed_circuit_breaker::DistributedCircuitBreaker`,
//! but state lives behind a `parking_lot::Mutex` rather than a Postgres-backed
//! store — spec.md §4.7 names only locks, the DLQ, and the manifest as
//! persisted state, so cross-instance breaker sharing is out of scope here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker {0:?} is open")]
    Open(String),
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
        }
    }
}

/// Must be used via [`CircuitBreaker::allow`]'s returned permit to report the
/// outcome of the guarded call back into the breaker's state.
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl<'a> CircuitBreakerPermit<'a> {
    pub fn success(self) {
        self.breaker.record_success();
    }

    pub fn failure(self) {
        self.breaker.record_failure();
    }
}

/// One circuit breaker keyed to a single downstream dependency (e.g. a
/// handler name or external system). Callers wanting several independent
/// breakers should keep several instances, or use [`CircuitBreakerRegistry`].
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(CircuitBreakerState::closed()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Decide whether a call may proceed. An `open` circuit whose cooldown
    /// has elapsed transitions to `half_open` and the call is allowed through
    /// as the probe; otherwise `open` fails immediately with no handler
    /// invocation.
    pub fn allow(&self) -> Result<CircuitBreakerPermit<'_>, CircuitBreakerError> {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                let elapsed = guard
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    guard.state = CircuitState::HalfOpen;
                    guard.success_count = 0;
                } else {
                    return Err(CircuitBreakerError::Open(self.key.clone()));
                }
            }
        }
        drop(guard);
        Ok(CircuitBreakerPermit { breaker: self })
    }

    fn record_success(&self) {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    *guard = CircuitBreakerState::closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.failure_count += 1;
                if guard.failure_count >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                guard.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Lazily creates and hands out one [`CircuitBreaker`] per key, all sharing
/// `config`. Mirrors [`crate::registry::HandlerRegistry`]'s lazy-insert shape.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
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
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::default().with_failure_threshold(2));
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.allow(), Err(CircuitBreakerError::Open(_))));
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::default().with_failure_threshold(2));
        breaker.allow().unwrap().failure();
        breaker.allow().unwrap().success();
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_millis(0)),
        );
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let permit = breaker.allow().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        permit.success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.allow().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(0)),
        );
        breaker.allow().unwrap().failure();
        let permit = breaker.allow().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        permit.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_hands_out_one_breaker_per_key() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get("svc-a");
        let b = registry.get("svc-a");
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.get("svc-b");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
