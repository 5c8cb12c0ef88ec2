//! Retry decisions with exponential backoff, `Retry-After` support and
//! optional deterministic jitter.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::config::duration_secs;
use crate::error::FetchError;

/// Random perturbation applied to backoff delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Jitter {
    #[default]
    None,
    /// Reproducible jitter: the same seed yields the same delay sequence.
    Seeded {
        seed: u64,
        /// Maximum relative deviation, `0.0..=1.0`.
        ratio: f64,
    },
    Random {
        ratio: f64,
    },
}

/// Configuration for the automatic retry mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    /// Delay before the second attempt.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Upper bound on a server-requested `Retry-After` delay.
    #[serde(with = "duration_secs")]
    pub max_retry_after: Duration,
    /// 4xx status codes that are retried in addition to every 5xx.
    pub retry_on_status: Vec<u16>,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(300),
            retry_on_status: vec![408, 429],
            jitter: Jitter::None,
        }
    }
}

impl RetryConfig {
    /// Disable retries: every failure is returned after the first attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check if a given HTTP status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        status >= 500 || self.retry_on_status.contains(&status)
    }

    /// Un-jittered delay after the given 1-based attempt:
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scale = self.backoff_multiplier.max(1.0).powi(exponent);
        let seconds = self.initial_delay.as_secs_f64() * scale;
        let capped_seconds = seconds.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped_seconds).unwrap_or(Duration::ZERO)
    }
}

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abort,
}

/// Stateful retry policy. Holds the jitter generator so seeded policies
/// replay the same sequence.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    rng: Option<Mutex<fastrand::Rng>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let rng = match config.jitter {
            Jitter::None => None,
            Jitter::Seeded { seed, .. } => Some(Mutex::new(fastrand::Rng::with_seed(seed))),
            Jitter::Random { .. } => Some(Mutex::new(fastrand::Rng::new())),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn is_retryable(&self, error: &FetchError) -> bool {
        match error {
            FetchError::NameResolution { .. } | FetchError::CircuitOpen { .. } => false,
            FetchError::Transport { .. } | FetchError::Decode { .. } => true,
            FetchError::HttpStatus { status, .. } => self.config.should_retry_status(*status),
        }
    }

    /// Decide what to do after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &FetchError) -> RetryDecision {
        if !self.is_retryable(error) || attempt >= self.config.max_attempts {
            return RetryDecision::Abort;
        }

        let backoff = self.jittered(self.config.backoff_delay(attempt));
        let delay = match error.retry_after() {
            Some(retry_after) => backoff.max(retry_after.min(self.config.max_retry_after)),
            None => backoff,
        };
        RetryDecision::RetryAfter(delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let ratio = match self.config.jitter {
            Jitter::None => return delay,
            Jitter::Seeded { ratio, .. } | Jitter::Random { ratio } => ratio.clamp(0.0, 1.0),
        };
        let Some(rng) = &self.rng else {
            return delay;
        };

        let unit = rng.lock().expect("retry jitter lock is not poisoned").f64();
        let factor = 1.0 + ratio * (2.0 * unit - 1.0);
        let seconds = (delay.as_secs_f64() * factor).min(self.config.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(delay)
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP-date.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: OffsetDateTime) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let at = OffsetDateTime::parse(trimmed, &Rfc2822).ok()?;
    let remaining = at - now;
    if remaining.is_positive() {
        Duration::try_from(remaining).ok()
    } else {
        Some(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceId;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..RetryConfig::default()
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let config = config(10);

        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(5)); // capped
        assert_eq!(config.backoff_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn aborts_once_attempts_are_exhausted() {
        let policy = RetryPolicy::new(config(3));
        let error = FetchError::timeout("read timed out");

        assert_eq!(
            policy.decide(1, &error),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(2, &error),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(policy.decide(3, &error), RetryDecision::Abort);
    }

    #[test]
    fn name_resolution_and_client_errors_abort_immediately() {
        let policy = RetryPolicy::new(config(5));

        assert_eq!(
            policy.decide(1, &FetchError::name_resolution("no such host")),
            RetryDecision::Abort
        );
        assert_eq!(
            policy.decide(1, &FetchError::status(400, "malformed filter")),
            RetryDecision::Abort
        );
        assert_eq!(
            policy.decide(
                1,
                &FetchError::CircuitOpen {
                    upstream: SourceId::parse("chembl").expect("valid"),
                }
            ),
            RetryDecision::Abort
        );
        assert!(matches!(
            policy.decide(1, &FetchError::status(429, "slow down")),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            policy.decide(1, &FetchError::status(502, "bad gateway")),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            policy.decide(1, &FetchError::decode("truncated body")),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn retry_after_header_wins_when_larger() {
        let policy = RetryPolicy::new(config(3));
        let error = FetchError::HttpStatus {
            status: 429,
            message: String::from("rate limited"),
            retry_after: Some(Duration::from_secs(5)),
        };

        match policy.decide(1, &error) {
            RetryDecision::RetryAfter(delay) => assert!(delay >= Duration::from_secs(5)),
            RetryDecision::Abort => panic!("429 must be retried"),
        }
    }

    #[test]
    fn oversized_retry_after_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retry_after: Duration::from_secs(30),
            ..config(3)
        });
        let error = FetchError::HttpStatus {
            status: 503,
            message: String::from("maintenance"),
            retry_after: Some(Duration::from_secs(86_400)),
        };

        assert_eq!(
            policy.decide(1, &error),
            RetryDecision::RetryAfter(Duration::from_secs(30))
        );
    }

    #[test]
    fn seeded_jitter_is_reproducible_and_bounded() {
        let jittered = RetryConfig {
            jitter: Jitter::Seeded {
                seed: 42,
                ratio: 0.5,
            },
            max_delay: Duration::from_secs(60),
            ..config(10)
        };
        let error = FetchError::transport("connection reset");

        let sequence = |policy: &RetryPolicy| -> Vec<RetryDecision> {
            (1..6).map(|attempt| policy.decide(attempt, &error)).collect()
        };
        let first = sequence(&RetryPolicy::new(jittered.clone()));
        let second = sequence(&RetryPolicy::new(jittered.clone()));
        assert_eq!(first, second);

        for (index, decision) in first.iter().enumerate() {
            let attempt = index as u32 + 1;
            let base = jittered.backoff_delay(attempt).as_secs_f64();
            match decision {
                RetryDecision::RetryAfter(delay) => {
                    let seconds = delay.as_secs_f64();
                    assert!(seconds >= base * 0.5 - 1e-9, "attempt={attempt} delay={seconds}");
                    assert!(seconds <= base * 1.5 + 1e-9, "attempt={attempt} delay={seconds}");
                }
                RetryDecision::Abort => panic!("attempt {attempt} should retry"),
            }
        }
    }

    #[test]
    fn parses_retry_after_seconds_and_dates() {
        let now = OffsetDateTime::parse("Tue, 15 Nov 1994 08:12:31 GMT", &Rfc2822)
            .expect("valid http date");

        assert_eq!(parse_retry_after("5", now), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_retry_after("Tue, 15 Nov 1994 08:12:41 GMT", now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            parse_retry_after("Tue, 15 Nov 1994 08:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-3", now), None);
        assert_eq!(parse_retry_after("1.5", now), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn unrepresentable_retry_after_is_ignored() {
        let now = OffsetDateTime::now_utc();

        assert_eq!(parse_retry_after("1e30", now), None);
        assert_eq!(parse_retry_after("inf", now), None);
        assert_eq!(parse_retry_after("NaN", now), None);
    }
}
