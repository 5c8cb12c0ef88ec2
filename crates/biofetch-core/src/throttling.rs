use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::Quota;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::SourceId;

type DirectRateLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request budget for one upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained rate; fractional values allow one call every few seconds.
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 1,
        }
    }
}

/// Returned by the non-blocking acquire path.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("rate limit exhausted; retry in {} ms", retry_after.as_millis())]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// Token-bucket rate limiter shared by every caller of one source.
///
/// [`acquire`](Self::acquire) waits for a token and is what batch extraction
/// uses; [`try_acquire`](Self::try_acquire) rejects instead and suits
/// interactive health checks.
pub struct RateLimiter {
    config: RateLimitConfig,
    limiter: DirectRateLimiter,
    clock: DefaultClock,
    last_acquired: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("last_acquired", &self.last_acquired())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let clock = DefaultClock::default();
        Self {
            config,
            limiter: governor::RateLimiter::direct_with_clock(quota_from_config(config), &clock),
            clock,
            last_acquired: Mutex::new(None),
        }
    }

    pub const fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait until a token is available. Never busy-polls.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
        self.touch();
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        match self.limiter.check() {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(not_until) => Err(RateLimited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            }),
        }
    }

    pub fn last_acquired(&self) -> Option<Instant> {
        *self
            .last_acquired
            .lock()
            .expect("rate limiter timestamp lock is not poisoned")
    }

    fn touch(&self) {
        let mut last = self
            .last_acquired
            .lock()
            .expect("rate limiter timestamp lock is not poisoned");
        *last = Some(Instant::now());
    }
}

/// Per-source rate limiters.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: Mutex<HashMap<SourceId, Arc<RateLimiter>>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter for `source`, created with `config` on first use. Later calls
    /// share the existing budget regardless of the config they pass.
    pub fn for_source(&self, source: &SourceId, config: RateLimitConfig) -> Arc<RateLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .expect("rate limiter registry lock is not poisoned");
        limiters
            .entry(source.clone())
            .or_insert_with(|| Arc::new(RateLimiter::new(config)))
            .clone()
    }
}

fn quota_from_config(config: RateLimitConfig) -> Quota {
    let burst = NonZeroU32::new(config.burst.max(1)).unwrap_or(NonZeroU32::MIN);

    let rate = if config.requests_per_second.is_finite() && config.requests_per_second > 0.0 {
        config.requests_per_second
    } else {
        1.0
    };
    let seconds_per_cell = (1.0 / rate).max(0.000_001);
    let period = Duration::try_from_secs_f64(seconds_per_cell).ok();

    period
        .and_then(Quota::with_period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst)
}
