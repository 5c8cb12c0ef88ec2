//! Batch extraction.
//!
//! One run moves through `normalize -> chunk loop -> reconcile`:
//!
//! 1. Raw identifiers are canonicalized; invalid ones are counted and
//!    dropped, duplicates collapse.
//! 2. The sorted ids are partitioned into [`RequestBatch`]es. Each batch is
//!    looked up in the cache by fingerprint; on a miss it is fetched through
//!    the [`ResilientClient`] and whatever came back is written to the cache.
//! 3. Requested ids are reconciled against the returned records. Every id
//!    ends up as exactly one [`FetchOutcome`]: a success, or a fallback that
//!    says why the record is missing.
//!
//! Batch-level failures degrade that batch to fallbacks and the run moves on.
//! Cancellation is observed between batches only.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{partition, RequestBatch};
use crate::cache::{build_cache, CacheBackend, CachedRecords};
use crate::client::{ClientFactory, RequestTally, ResilientClient};
use crate::config::ExtractionConfig;
use crate::error::{ConfigError, FetchError};
use crate::fingerprint::Fingerprint;
use crate::identifier::{CanonicalId, IdentifierNormalizer, InvalidIdentifier, RawIdentifier};
use crate::payload::{error_message, is_error_record, KeyedRecord};
use crate::stats::BatchStatistics;

/// Why an identifier has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The upstream answered but did not include the identifier.
    NotReturned,
    /// The upstream returned an error marker for the identifier.
    ErrorRecord,
    /// The whole batch request failed.
    BatchFailed,
    /// The breaker suppressed the batch request.
    CircuitOpen,
    /// The run stopped before the identifier's batch was requested.
    Cancelled,
}

impl FallbackReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotReturned => "not_returned",
            Self::ErrorRecord => "error_record",
            Self::BatchFailed => "batch_failed",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the fallback is counted in `errors`.
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl Display for FallbackReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthesized stand-in for a record that could not be retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub id: CanonicalId,
    pub reason: FallbackReason,
    pub message: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

impl FallbackRecord {
    pub fn new(id: CanonicalId, reason: FallbackReason, message: impl Into<String>) -> Self {
        Self {
            id,
            reason,
            message: message.into(),
            error_type: None,
            error_message: None,
            timestamp: utc_timestamp(),
        }
    }

    pub fn with_error(mut self, error_type: impl Into<String>, error_message: Option<String>) -> Self {
        self.error_type = Some(error_type.into());
        self.error_message = error_message;
        self
    }

    fn from_fetch_error(id: CanonicalId, error: &FetchError) -> Self {
        let (reason, message) = match error {
            FetchError::CircuitOpen { .. } => (
                FallbackReason::CircuitOpen,
                String::from("upstream circuit breaker is open; request suppressed"),
            ),
            other => (
                FallbackReason::BatchFailed,
                format!("batch request failed ({})", other.kind()),
            ),
        };
        Self::new(id, reason, message).with_error(error.kind().as_str(), Some(error.to_string()))
    }
}

/// Result for one requested identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success {
        id: CanonicalId,
        record: Value,
        from_cache: bool,
    },
    Fallback(FallbackRecord),
}

impl FetchOutcome {
    pub fn id(&self) -> &CanonicalId {
        match self {
            Self::Success { id, .. } => id,
            Self::Fallback(fallback) => &fallback.id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn fallback(&self) -> Option<&FallbackRecord> {
        match self {
            Self::Fallback(fallback) => Some(fallback),
            Self::Success { .. } => None,
        }
    }

    /// Materialize as one output row keyed by `id_field`.
    pub fn to_record(&self, id_field: &str) -> Value {
        match self {
            Self::Success { id, record, .. } => match record {
                Value::Object(object) if !object.contains_key(id_field) => {
                    let mut object = object.clone();
                    object.insert(id_field.to_owned(), Value::String(id.to_string()));
                    Value::Object(object)
                }
                other => other.clone(),
            },
            Self::Fallback(fallback) => {
                let mut row = Map::new();
                row.insert(id_field.to_owned(), Value::String(fallback.id.to_string()));
                row.insert(
                    String::from("fallback_reason"),
                    Value::String(fallback.reason.as_str().to_owned()),
                );
                row.insert(
                    String::from("fallback_message"),
                    Value::String(fallback.message.clone()),
                );
                row.insert(
                    String::from("fallback_error_type"),
                    fallback.error_type.clone().map_or(Value::Null, Value::String),
                );
                row.insert(
                    String::from("fallback_error_message"),
                    fallback.error_message.clone().map_or(Value::Null, Value::String),
                );
                row.insert(
                    String::from("fallback_timestamp"),
                    Value::String(fallback.timestamp.clone()),
                );
                Value::Object(row)
            }
        }
    }
}

/// Outcome of one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub run_id: Uuid,
    /// One outcome per valid requested identifier, sorted by identifier.
    pub records: Vec<FetchOutcome>,
    pub invalid: Vec<InvalidIdentifier>,
    pub stats: BatchStatistics,
}

impl ExtractionResult {
    pub fn rows(&self, id_field: &str) -> Vec<Value> {
        self.records
            .iter()
            .map(|outcome| outcome.to_record(id_field))
            .collect()
    }

    pub fn outcome(&self, id: &str) -> Option<&FetchOutcome> {
        self.records
            .iter()
            .find(|outcome| outcome.id().as_str() == id)
    }
}

/// Turns identifier lists into complete record sets.
pub struct BatchExtractor {
    config: ExtractionConfig,
    client: ResilientClient,
    cache: Option<Arc<dyn CacheBackend>>,
    normalizer: IdentifierNormalizer,
    endpoint: String,
}

impl std::fmt::Debug for BatchExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExtractor")
            .field("source", &self.config.source)
            .field("endpoint", &self.endpoint)
            .field("cache", &self.cache.as_ref().map(|cache| cache.name()))
            .finish_non_exhaustive()
    }
}

impl BatchExtractor {
    /// Validate `config` and assemble an extractor. No network activity.
    pub fn new(
        config: ExtractionConfig,
        client: ResilientClient,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let endpoint = format!("/{}", config.endpoint.trim().trim_start_matches('/'));
        Ok(Self {
            normalizer: config.normalizer(),
            config,
            client,
            cache,
            endpoint,
        })
    }

    /// Build the client and the configured cache backend from `factory`.
    pub fn from_config(config: ExtractionConfig, factory: &ClientFactory) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = factory.client_for(&config)?;
        let cache = build_cache(&config.cache, &config.identity);
        Self::new(config, client, cache)
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    pub async fn extract<I>(&self, raw_ids: I, cancel: &CancellationToken) -> ExtractionResult
    where
        I: IntoIterator,
        I::Item: Into<RawIdentifier>,
    {
        self.extract_until(raw_ids, cancel, None).await
    }

    /// Like [`extract`](Self::extract), also stopping at `deadline`.
    pub async fn extract_until<I>(
        &self,
        raw_ids: I,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ExtractionResult
    where
        I: IntoIterator,
        I::Item: Into<RawIdentifier>,
    {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let normalized = self.normalizer.normalize_all(raw_ids);

        let mut stats = BatchStatistics::new(normalized.ids.len(), normalized.invalid.len());
        tracing::info!(
            %run_id,
            source = %self.client.source(),
            requested = normalized.ids.len(),
            invalid = normalized.invalid.len(),
            duplicates = normalized.duplicates,
            "extraction started"
        );
        for invalid in &normalized.invalid {
            tracing::debug!(%run_id, raw = %invalid.raw, error = %invalid.error, "dropping invalid identifier");
        }

        let batches = partition(&normalized.ids, self.config.max_batch_size);
        let mut outcomes = Vec::with_capacity(normalized.ids.len());
        let mut tally = RequestTally::default();

        for (position, batch) in batches.iter().enumerate() {
            if let Some(reason) = stop_reason(cancel, deadline) {
                let remaining: usize = batches[position..].iter().map(RequestBatch::len).sum();
                tracing::warn!(%run_id, reason, remaining, "extraction stopped early");
                for id in batches[position..].iter().flat_map(RequestBatch::ids) {
                    outcomes.push(FetchOutcome::Fallback(FallbackRecord::new(
                        id.clone(),
                        FallbackReason::Cancelled,
                        format!("extraction {reason} before this identifier was requested"),
                    )));
                }
                stats.fallback += remaining;
                stats.cancelled = true;
                break;
            }

            stats.batches += 1;
            self.run_batch(run_id, batch, &mut tally, &mut stats, &mut outcomes)
                .await;
        }

        outcomes.sort_by(|left, right| left.id().cmp(right.id()));
        stats.api_calls = tally.api_calls;
        stats.retries = tally.retries;
        stats.finish(started.elapsed());

        tracing::info!(
            %run_id,
            source = %self.client.source(),
            success = stats.success,
            fallback = stats.fallback,
            errors = stats.errors,
            api_calls = stats.api_calls,
            cache_hits = stats.cache_hits,
            batches = stats.batches,
            duration_ms = stats.duration_ms,
            "extraction finished"
        );

        ExtractionResult {
            run_id,
            records: outcomes,
            invalid: normalized.invalid,
            stats,
        }
    }

    async fn run_batch(
        &self,
        run_id: Uuid,
        batch: &RequestBatch,
        tally: &mut RequestTally,
        stats: &mut BatchStatistics,
        outcomes: &mut Vec<FetchOutcome>,
    ) {
        let fingerprint = Fingerprint::compute(batch.ids(), &self.config.identity);

        if let Some(entry) = self.cache.as_ref().and_then(|cache| cache.get(&fingerprint)) {
            tracing::debug!(%run_id, batch = batch.index(), %fingerprint, "cache hit");
            stats.cache_hits += batch.len();
            self.reconcile(batch, &entry.records, true, stats, outcomes);
            return;
        }

        match self.fetch_batch(batch, tally).await {
            Ok(records) => {
                if let Some(cache) = self.cache.as_ref().filter(|_| !records.is_empty()) {
                    if let Err(error) = cache.set(&fingerprint, &records) {
                        tracing::warn!(%run_id, batch = batch.index(), %error, "cache write failed");
                    }
                }
                self.reconcile(batch, &records, false, stats, outcomes);
            }
            Err(error) => {
                tracing::warn!(
                    %run_id,
                    batch = batch.index(),
                    ids = batch.len(),
                    kind = %error.kind(),
                    %error,
                    "batch failed; emitting fallbacks"
                );
                for id in batch.ids() {
                    outcomes.push(FetchOutcome::Fallback(FallbackRecord::from_fetch_error(
                        id.clone(),
                        &error,
                    )));
                }
                stats.fallback += batch.len();
                stats.errors += batch.len();
            }
        }
    }

    async fn fetch_batch(
        &self,
        batch: &RequestBatch,
        tally: &mut RequestTally,
    ) -> Result<CachedRecords, FetchError> {
        let limit = self
            .config
            .page_limit
            .map_or(batch.len(), |limit| limit as usize);
        let mut params = vec![
            (self.config.id_param.clone(), batch.joined()),
            (String::from("limit"), limit.to_string()),
        ];
        if !self.config.fields.is_empty() {
            params.push((String::from("only"), self.config.fields.join(",")));
        }

        let pages = self
            .client
            .fetch_all_pages(
                &self.endpoint,
                &params,
                self.config.items_key.as_deref(),
                tally,
            )
            .await?;

        let requested: HashSet<&CanonicalId> = batch.ids().iter().collect();
        let mut records = CachedRecords::new();
        for page in pages {
            let (keyed, unkeyed) = page.into_keyed_records(&self.config.id_field);
            if unkeyed > 0 {
                tracing::debug!(
                    batch = batch.index(),
                    unkeyed,
                    id_field = %self.config.id_field,
                    "skipping records without an identifier"
                );
            }

            for KeyedRecord { key, record } in keyed {
                let Ok(id) = self.normalizer.normalize_text(&key) else {
                    continue;
                };
                if requested.contains(&id) {
                    records.entry(id).or_insert(record);
                }
            }
        }

        Ok(records)
    }

    fn reconcile(
        &self,
        batch: &RequestBatch,
        records: &CachedRecords,
        from_cache: bool,
        stats: &mut BatchStatistics,
        outcomes: &mut Vec<FetchOutcome>,
    ) {
        for id in batch.ids() {
            let outcome = match records.get(id) {
                Some(record) if !is_error_record(record) => {
                    stats.success += 1;
                    FetchOutcome::Success {
                        id: id.clone(),
                        record: record.clone(),
                        from_cache,
                    }
                }
                Some(record) => {
                    stats.fallback += 1;
                    stats.errors += 1;
                    FetchOutcome::Fallback(
                        FallbackRecord::new(
                            id.clone(),
                            FallbackReason::ErrorRecord,
                            "upstream returned an error for this identifier",
                        )
                        .with_error("upstream_error", error_message(record)),
                    )
                }
                None => {
                    stats.fallback += 1;
                    stats.errors += 1;
                    FetchOutcome::Fallback(FallbackRecord::new(
                        id.clone(),
                        FallbackReason::NotReturned,
                        "record not returned by upstream",
                    ))
                }
            };
            outcomes.push(outcome);
        }
    }
}

fn stop_reason(cancel: &CancellationToken, deadline: Option<Instant>) -> Option<&'static str> {
    if cancel.is_cancelled() {
        Some("cancelled")
    } else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        Some("deadline exceeded")
    } else {
        None
    }
}

fn utc_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
