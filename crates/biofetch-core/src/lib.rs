//! # Biofetch Core
//!
//! Resilient batched extraction from paginated, rate-limited JSON APIs.
//!
//! ## Overview
//!
//! Given a list of identifiers, the extractor returns exactly one row per
//! valid identifier: the upstream record, or an explicit fallback explaining
//! why there is none. Along the way it provides:
//!
//! - **Identifier canonicalization** so `"10"`, `10` and `10.0` are one request
//! - **Batching** bounded by upstream URL-length limits
//! - **TTL caching** keyed on a deterministic batch fingerprint
//! - **Retries** with exponential backoff and `Retry-After` support
//! - **Circuit breaking** and **rate limiting** per upstream source
//! - **Pagination** that follows `page_meta.next` across environments
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Request batches and partitioning |
//! | [`cache`] | Memory, file and tiered TTL caches |
//! | [`circuit_breaker`] | Per-source circuit breakers |
//! | [`client`] | Resilient client and client factory |
//! | [`config`] | Extraction configuration |
//! | [`error`] | Core error types |
//! | [`extractor`] | Batch extraction state machine |
//! | [`fingerprint`] | Cache fingerprints and generations |
//! | [`http_client`] | HTTP transport abstraction and session registry |
//! | [`identifier`] | Identifier normalization |
//! | [`pagination`] | Next-page cursor resolution |
//! | [`payload`] | Upstream response shapes |
//! | [`retry`] | Retry policy |
//! | [`source`] | Source identifiers |
//! | [`stats`] | Run statistics |
//! | [`throttling`] | Rate limiting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use biofetch_core::{BatchExtractor, ClientFactory, ExtractionConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExtractionConfig::from_path("chembl.yaml".as_ref())?;
//!     let factory = ClientFactory::from_http(&config.http);
//!     let extractor = BatchExtractor::from_config(config, &factory)?;
//!
//!     let result = extractor
//!         .extract(["CHEMBL25", "CHEMBL1201585"], &CancellationToken::new())
//!         .await;
//!     println!("{}", serde_json::to_string(&result.stats)?);
//!
//!     factory.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ BatchExtractor  │── normalize ── partition ── reconcile
//! └────────┬────────┘
//!          │ per batch
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Fingerprint     │────▶│ Cache Backend    │
//! └────────┬────────┘     │ (memory/file)    │
//!          │ miss         └──────────────────┘
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ ResilientClient │────▶│ Circuit Breaker  │
//! │                 │────▶│ Rate Limiter     │
//! │                 │────▶│ Retry Policy     │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ HTTP Client     │
//! │ (reqwest)       │
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Only configuration errors stop a run, and they surface before any network
//! activity. Upstream failures become fallback rows:
//!
//! ```rust
//! use biofetch_core::{FetchError, FetchErrorKind};
//!
//! fn describe(error: &FetchError) -> &'static str {
//!     match error.kind() {
//!         FetchErrorKind::NameResolution => "check the base url",
//!         FetchErrorKind::CircuitOpen => "upstream is cooling down",
//!         _ if error.retryable() => "transient",
//!         _ => "permanent",
//!     }
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod http_client;
pub mod identifier;
pub mod pagination;
pub mod payload;
pub mod retry;
pub mod source;
pub mod stats;
pub mod throttling;

// Re-export commonly used types at crate root for convenience

// Batching
pub use batch::{partition, RequestBatch, DEFAULT_MAX_BATCH_SIZE, MAX_BATCH_SIZE_LIMIT};

// Caching
pub use cache::{
    build_cache, CacheBackend, CacheBackendKind, CacheConfig, CacheEntry, CacheError,
    CachedRecords, FileCache, MemoryCache, TieredCache, CACHE_DIR_ENV,
};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState};

// Client
pub use client::{ClientFactory, ProbeOutcome, RequestTally, ResilientClient};

// Configuration
pub use config::ExtractionConfig;

// Error types
pub use error::{ConfigError, FetchError, FetchErrorKind, ValidationError};

// Extraction
pub use extractor::{
    BatchExtractor, ExtractionResult, FallbackReason, FallbackRecord, FetchOutcome,
};

// Fingerprints
pub use fingerprint::{CacheContext, Fingerprint};

// HTTP client types
pub use http_client::{
    HttpClient, HttpConfig, HttpRequest, HttpResponse, ReqwestHttpClient, SessionRegistry,
};

// Identifiers
pub use identifier::{
    CanonicalId, CaseFolding, IdentifierNormalizer, InvalidIdentifier, NormalizedIds,
    RawIdentifier,
};

// Pagination and payloads
pub use pagination::{resolve_next_page, PageResolver, DEFAULT_API_ROOT_MARKER};
pub use payload::{is_error_record, PageMeta, ResponsePayload};

// Retry logic
pub use retry::{parse_retry_after, Jitter, RetryConfig, RetryDecision, RetryPolicy};

// Source identifiers
pub use source::SourceId;

// Statistics
pub use stats::BatchStatistics;

// Throttling
pub use throttling::{RateLimitConfig, RateLimited, RateLimiter, RateLimiters};
