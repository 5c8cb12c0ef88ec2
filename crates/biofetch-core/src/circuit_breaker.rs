use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::duration_secs;
use crate::source::SourceId;

/// Runtime circuit state for upstream calls.
///
/// There is no persisted half-open state: once the holdoff has elapsed the
/// breaker reports `Closed`, lets the next call through as a probe, and a
/// failure of that probe reopens it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(rename = "holdoff_seconds", with = "duration_secs")]
    pub holdoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            holdoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitInner {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitInner {
    fn is_open(&self, config: &CircuitBreakerConfig, now: Instant) -> bool {
        if self.consecutive_failures < config.failure_threshold.max(1) {
            return false;
        }

        self.last_failure_at
            .map(|at| now.saturating_duration_since(at) < config.holdoff)
            .unwrap_or(false)
    }
}

/// Thread-safe circuit breaker for one upstream source.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Must be checked before a rate-limit slot is consumed.
    pub fn should_allow_call(&self) -> bool {
        !self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open(&self.config, Instant::now())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
    }

    /// Returns `true` when this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let was_open = inner.is_open(&self.config, now);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);
        !was_open && inner.is_open(&self.config, now)
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
    }
}

/// Per-source circuit breakers sharing one configuration.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<SourceId, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_source(&self, source: &SourceId) -> Arc<CircuitBreaker> {
        self.for_source_with(source, self.config)
    }

    /// Breaker for `source`, created with `config` on first use. An existing
    /// breaker keeps its state and configuration.
    pub fn for_source_with(
        &self,
        source: &SourceId,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .expect("circuit breaker registry lock is not poisoned");
        breakers
            .entry(source.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    /// Snapshot of every known source's state.
    pub fn states(&self) -> Vec<(SourceId, CircuitState)> {
        let breakers = self
            .breakers
            .lock()
            .expect("circuit breaker registry lock is not poisoned");
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(source, breaker)| (source.clone(), breaker.state()))
            .collect();
        states.sort_by(|left, right| left.0.cmp(&right.0));
        states
    }
}
