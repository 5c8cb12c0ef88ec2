//! Extraction configuration.
//!
//! Everything is optional at the serde layer so partial YAML files pick up
//! defaults; [`ExtractionConfig::validate`] enforces the required settings
//! and is run before any network activity.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::{DEFAULT_MAX_BATCH_SIZE, MAX_BATCH_SIZE_LIMIT};
use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::fingerprint::CacheContext;
use crate::http_client::HttpConfig;
use crate::identifier::{CaseFolding, IdentifierNormalizer};
use crate::pagination::{PageResolver, DEFAULT_API_ROOT_MARKER};
use crate::retry::{Jitter, RetryConfig};
use crate::source::SourceId;
use crate::throttling::RateLimitConfig;

/// Serde adapter for `Duration` as (fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(|_| {
            D::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {seconds}"
            ))
        })
    }
}

/// Settings for one extraction source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Source id used for breaker, limiter and session scoping.
    pub source: String,
    pub base_url: String,
    /// Endpoint path relative to `base_url`, e.g. `molecule.json`.
    pub endpoint: String,
    /// Filter parameter that takes the comma-joined identifiers.
    pub id_param: String,
    /// Record field holding the identifier.
    pub id_field: String,
    /// Name of the item array in envelope responses.
    pub items_key: Option<String>,
    /// Fields requested through the `only` parameter. Empty means all.
    pub fields: Vec<String>,
    /// Page size sent as `limit`; defaults to the batch length.
    pub page_limit: Option<u32>,
    pub max_batch_size: usize,
    pub max_pages: usize,
    pub api_root_marker: String,
    pub case_folding: CaseFolding,
    pub identity: CacheContext,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            base_url: String::new(),
            endpoint: String::new(),
            id_param: String::new(),
            id_field: String::new(),
            items_key: None,
            fields: Vec::new(),
            page_limit: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_pages: 100,
            api_root_marker: DEFAULT_API_ROOT_MARKER.to_owned(),
            case_folding: CaseFolding::Preserve,
            identity: CacheContext::new("", "1", ""),
            http: HttpConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ExtractionConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn source_id(&self) -> Result<SourceId, ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::Missing("source"));
        }
        SourceId::parse(&self.source).map_err(|error| ConfigError::invalid("source", error.to_string()))
    }

    pub fn resolver(&self) -> Result<PageResolver, ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("base_url"));
        }
        PageResolver::new(&self.base_url, &self.api_root_marker)
    }

    pub fn normalizer(&self) -> IdentifierNormalizer {
        IdentifierNormalizer::new(self.case_folding)
    }

    /// Check required settings and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_id()?;
        self.resolver()?;
        require("endpoint", &self.endpoint)?;
        require("id_param", &self.id_param)?;
        require("id_field", &self.id_field)?;

        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(ConfigError::invalid(
                "max_batch_size",
                format!(
                    "must be between 1 and {MAX_BATCH_SIZE_LIMIT}, got {}",
                    self.max_batch_size
                ),
            ));
        }
        if self.max_pages == 0 {
            return Err(ConfigError::invalid("max_pages", "must be at least 1"));
        }
        if self.page_limit == Some(0) {
            return Err(ConfigError::invalid("page_limit", "must be at least 1"));
        }

        if self.cache.enabled {
            require("identity.pipeline", &self.identity.pipeline)?;
            require("identity.pipeline_version", &self.identity.pipeline_version)?;
            require("identity.release", &self.identity.release)?;
        }

        self.validate_resilience()
    }

    fn validate_resilience(&self) -> Result<(), ConfigError> {
        if self.http.timeout_ms == 0 {
            return Err(ConfigError::invalid("http.timeout_ms", "must be positive"));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                format!("must be a finite number >= 1.0, got {}", retry.backoff_multiplier),
            ));
        }
        if retry.max_delay < retry.initial_delay {
            return Err(ConfigError::invalid(
                "retry.max_delay",
                "must not be shorter than retry.initial_delay",
            ));
        }
        if let Jitter::Seeded { ratio, .. } | Jitter::Random { ratio } = retry.jitter {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::invalid(
                    "retry.jitter.ratio",
                    format!("must be within 0.0..=1.0, got {ratio}"),
                ));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }

        let rate = self.rate_limit.requests_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::invalid(
                "rate_limit.requests_per_second",
                format!("must be a positive number, got {rate}"),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::invalid("rate_limit.burst", "must be at least 1"));
        }

        Ok(())
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(field))
    } else {
        Ok(())
    }
}
