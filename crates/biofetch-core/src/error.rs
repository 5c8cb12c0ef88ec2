use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::SourceId;

/// Validation errors for identifiers, sources and batches.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identifier cannot be empty")]
    EmptyIdentifier,
    #[error("identifier contains reserved character '{ch}' at index {index}")]
    IdentifierReservedChar { ch: char, index: usize },
    #[error("identifier contains a control character at index {index}")]
    IdentifierControlChar { index: usize },
    #[error("numeric identifier must be finite and integral: '{value}'")]
    NonIntegralIdentifier { value: String },
    #[error("identifier must be a string or number, got {kind}")]
    UnsupportedIdentifierType { kind: &'static str },

    #[error("source id cannot be empty")]
    EmptySource,
    #[error("source id contains invalid character '{ch}' at index {index}")]
    SourceInvalidChar { ch: char, index: usize },

    #[error("batch cannot be empty")]
    EmptyBatch,
    #[error("batch size {len} exceeds max {max}")]
    BatchTooLarge { len: usize, max: usize },
}

/// Failure class of a single upstream fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Transport,
    NameResolution,
    HttpStatus,
    CircuitOpen,
    Decode,
}

impl FetchErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::NameResolution => "name_resolution",
            Self::HttpStatus => "http_status",
            Self::CircuitOpen => "circuit_open",
            Self::Decode => "decode",
        }
    }
}

impl Display for FetchErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the resilient client for one logical request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {message}")]
    Transport { message: String, timeout: bool },

    #[error("name resolution failed: {message}")]
    NameResolution { message: String },

    #[error("upstream returned status {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("circuit breaker for '{upstream}' is open; call suppressed")]
    CircuitOpen { upstream: SourceId },

    #[error("invalid upstream payload: {message}")]
    Decode { message: String },
}

impl FetchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timeout: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timeout: true,
        }
    }

    pub fn name_resolution(message: impl Into<String>) -> Self {
        Self::NameResolution {
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Transport { .. } => FetchErrorKind::Transport,
            Self::NameResolution { .. } => FetchErrorKind::NameResolution,
            Self::HttpStatus { .. } => FetchErrorKind::HttpStatus,
            Self::CircuitOpen { .. } => FetchErrorKind::CircuitOpen,
            Self::Decode { .. } => FetchErrorKind::Decode,
        }
    }

    /// Default retry classification, independent of any policy overrides.
    pub const fn retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Decode { .. } => true,
            Self::NameResolution { .. } | Self::CircuitOpen { .. } => false,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        }
    }

    /// Whether the failure says anything about upstream health.
    ///
    /// Client errors such as 400 or 404 describe the request, not the
    /// upstream, and must not trip the circuit breaker.
    pub const fn counts_against_upstream(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::CircuitOpen { .. } => false,
            Self::Transport { .. } | Self::NameResolution { .. } | Self::Decode { .. } => true,
        }
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Configuration errors. These are the only errors that abort a run, and they
/// are always raised before any network activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
