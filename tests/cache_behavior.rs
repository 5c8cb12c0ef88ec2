//! Behavior-driven tests for batch response caching
//!
//! These tests verify that a warm rerun is served without network access,
//! that cache generations are scoped by release and pipeline identity, and
//! that bad entries or failed batches never poison later runs.

mod support;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use biofetch_core::{
    CacheBackend, CacheContext, CachedRecords, CanonicalId, FetchOutcome, FileCache, Fingerprint,
    HttpResponse, MemoryCache,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use support::{config, documents_page, extractor, ids, FakeUpstream};

const HOUR: Duration = Duration::from_secs(3_600);

fn file_cache(root: &TempDir) -> Arc<FileCache> {
    Arc::new(FileCache::for_context(root.path(), &config().identity, Some(HOUR)))
}

fn shared(cache: &Arc<FileCache>) -> Option<Arc<dyn CacheBackend>> {
    let backend: Arc<dyn CacheBackend> = cache.clone();
    Some(backend)
}

fn canonical(raw: &[&str]) -> Vec<CanonicalId> {
    raw.iter()
        .map(|id| CanonicalId::parse(id).expect("valid id"))
        .collect()
}

// =============================================================================
// Cache: Warm Reruns
// =============================================================================

#[tokio::test]
async fn warm_rerun_is_served_entirely_from_cache() {
    // Given: A file cache and an upstream that serves every document
    let root = TempDir::new().expect("tempdir");
    let cache = file_cache(&root);
    let upstream = FakeUpstream::serving_documents();
    let extractor = extractor(config(), upstream.clone(), shared(&cache));
    let cancel = CancellationToken::new();

    // When: The same ids are extracted twice
    let cold = extractor.extract(ids(&["1", "2", "3"]), &cancel).await;
    let warm = extractor.extract(ids(&["3", "2", "1"]), &cancel).await;

    // Then: The second run made no requests and every id was a cache hit
    assert_eq!(cold.stats.api_calls, 1);
    assert_eq!(cold.stats.cache_hits, 0);
    assert_eq!(warm.stats.api_calls, 0);
    assert_eq!(warm.stats.cache_hits, 3);
    assert_eq!(warm.stats.success, 3);
    assert_eq!(upstream.request_count(), 1);
    assert!(warm
        .records
        .iter()
        .all(|outcome| matches!(outcome, FetchOutcome::Success { from_cache: true, .. })));
    assert_eq!(cold.rows("document_chembl_id"), warm.rows("document_chembl_id"));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn disabled_cache_always_goes_to_the_network() {
    // Given: No cache backend
    let upstream = FakeUpstream::serving_documents();
    let extractor = extractor(config(), upstream.clone(), None);
    let cancel = CancellationToken::new();

    // When: The same ids are extracted twice
    extractor.extract(ids(&["1", "2"]), &cancel).await;
    let second = extractor.extract(ids(&["1", "2"]), &cancel).await;

    // Then: Both runs hit the upstream
    assert_eq!(second.stats.cache_hits, 0);
    assert_eq!(second.stats.api_calls, 1);
    assert_eq!(upstream.request_count(), 2);
}

#[tokio::test]
async fn partial_results_are_cached_and_reconciled_again() {
    // Given: An upstream that only knows document "1"
    let root = TempDir::new().expect("tempdir");
    let cache = file_cache(&root);
    let upstream = FakeUpstream::new(|_| Ok(documents_page(&ids(&["1"]), None)));
    let extractor = extractor(config(), upstream.clone(), shared(&cache));
    let cancel = CancellationToken::new();

    // When: Extracting ["1", "2"] twice
    extractor.extract(ids(&["1", "2"]), &cancel).await;
    let warm = extractor.extract(ids(&["1", "2"]), &cancel).await;

    // Then: The warm run is served from cache and "2" still falls back
    assert_eq!(upstream.request_count(), 1);
    assert_eq!(warm.stats.success, 1);
    assert_eq!(warm.stats.fallback, 1);
    assert!(warm.outcome("2").and_then(FetchOutcome::fallback).is_some());
}

#[tokio::test]
async fn empty_and_failed_batches_are_not_cached() {
    // Given: An upstream that returns nothing, then fails, then recovers
    let root = TempDir::new().expect("tempdir");
    let cache = file_cache(&root);
    let calls = std::sync::atomic::AtomicUsize::new(0);
    let upstream = FakeUpstream::new(move |request| {
        match calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
            0 => Ok(HttpResponse::ok_json(
                json!({"documents": [], "page_meta": {"next": null}}).to_string(),
            )),
            1 => Ok(HttpResponse::with_status(400, "bad filter")),
            _ => Ok(documents_page(&support::requested_ids(request), None)),
        }
    });
    let extractor = extractor(config(), upstream.clone(), shared(&cache));
    let cancel = CancellationToken::new();

    // When: Three runs over the same ids
    let empty = extractor.extract(ids(&["1"]), &cancel).await;
    assert_eq!(empty.stats.fallback, 1);
    assert!(cache.is_empty());

    let failed = extractor.extract(ids(&["1"]), &cancel).await;
    assert_eq!(failed.stats.errors, 1);
    assert!(cache.is_empty());

    let recovered = extractor.extract(ids(&["1"]), &cancel).await;

    // Then: Each run reached the upstream and only the good answer was stored
    assert_eq!(upstream.request_count(), 3);
    assert_eq!(recovered.stats.success, 1);
    assert_eq!(recovered.stats.cache_hits, 0);
    assert_eq!(cache.len(), 1);
}

// =============================================================================
// Cache: Fingerprints and Generations
// =============================================================================

#[test]
fn fingerprint_depends_only_on_ids_and_generation() {
    let context = CacheContext::new("document", "1.0.0", "chembl_34");

    // Order and duplicates do not matter
    let forward = Fingerprint::compute(&canonical(&["1", "2", "3"]), &context);
    let shuffled = Fingerprint::compute(&canonical(&["3", "1", "2", "1"]), &context);
    assert_eq!(forward, shuffled);
    assert_eq!(forward.as_str().len(), 64);
    assert_eq!(Fingerprint::from_hex(forward.as_str()), Some(forward.clone()));

    // Release, pipeline and pipeline version all scope the fingerprint
    for other in [
        CacheContext::new("document", "1.0.0", "chembl_35"),
        CacheContext::new("activity", "1.0.0", "chembl_34"),
        CacheContext::new("document", "1.1.0", "chembl_34"),
    ] {
        assert_ne!(Fingerprint::compute(&canonical(&["1", "2", "3"]), &other), forward);
    }
}

#[tokio::test]
async fn new_release_starts_a_new_cache_generation() {
    // Given: A warm cache for release chembl_34
    let root = TempDir::new().expect("tempdir");
    let upstream = FakeUpstream::serving_documents();
    let old = extractor(config(), upstream.clone(), shared(&file_cache(&root)));
    old.extract(ids(&["1"]), &CancellationToken::new()).await;

    // When: The same ids are extracted for release chembl_35
    let mut next_release = config();
    next_release.identity = CacheContext::new("document", "1.0.0", "chembl_35");
    let cache = Arc::new(FileCache::for_context(root.path(), &next_release.identity, Some(HOUR)));
    let new = extractor(next_release, upstream.clone(), shared(&cache));
    let result = new.extract(ids(&["1"]), &CancellationToken::new()).await;

    // Then: The old generation is not consulted
    assert_eq!(result.stats.cache_hits, 0);
    assert_eq!(upstream.request_count(), 2);
    assert!(root.path().join("document").join("chembl_34").is_dir());
    assert!(root.path().join("document").join("chembl_35").is_dir());
}

#[tokio::test]
async fn deleting_the_release_directory_invalidates_the_generation() {
    // Given: A warm cache
    let root = TempDir::new().expect("tempdir");
    let upstream = FakeUpstream::serving_documents();
    let extractor = extractor(config(), upstream.clone(), shared(&file_cache(&root)));
    let cancel = CancellationToken::new();
    extractor.extract(ids(&["1"]), &cancel).await;

    // When: The release directory is removed and the run repeated
    fs::remove_dir_all(root.path().join("document").join("chembl_34")).expect("remove release");
    let result = extractor.extract(ids(&["1"]), &cancel).await;

    // Then: The batch was fetched again
    assert_eq!(result.stats.cache_hits, 0);
    assert_eq!(upstream.request_count(), 2);
}

// =============================================================================
// Cache: Expiry and Corruption
// =============================================================================

#[tokio::test]
async fn expired_entries_are_refetched() {
    // Given: A warm file cache whose entry is older than the TTL
    let root = TempDir::new().expect("tempdir");
    let cache = file_cache(&root);
    let upstream = FakeUpstream::serving_documents();
    let extractor = extractor(config(), upstream.clone(), shared(&cache));
    let cancel = CancellationToken::new();
    extractor.extract(ids(&["1"]), &cancel).await;

    let path = cache.entry_path(&Fingerprint::compute(&canonical(&["1"]), &config().identity));
    fs::File::options()
        .write(true)
        .open(&path)
        .and_then(|file| file.set_modified(SystemTime::now() - 2 * HOUR))
        .expect("age the entry");

    // When: The run is repeated
    let result = extractor.extract(ids(&["1"]), &cancel).await;

    // Then: The stale entry was ignored and replaced
    assert_eq!(result.stats.cache_hits, 0);
    assert_eq!(upstream.request_count(), 2);
    assert!(cache.get(&Fingerprint::compute(&canonical(&["1"]), &config().identity)).is_some());
}

#[test]
fn memory_entries_expire_after_ttl() {
    let cache = MemoryCache::new(16, Some(Duration::from_millis(20)));
    let fingerprint = Fingerprint::compute(&canonical(&["1"]), &config().identity);
    let records: CachedRecords = [(CanonicalId::parse("1").expect("valid"), json!({"title": "x"}))]
        .into_iter()
        .collect();

    cache.set(&fingerprint, &records).expect("memory set");
    assert!(cache.get(&fingerprint).is_some());

    std::thread::sleep(Duration::from_millis(40));
    assert!(cache.get(&fingerprint).is_none());
}

#[tokio::test]
async fn corrupt_entries_are_discarded_and_refetched() {
    // Given: A cache entry that is not valid JSON
    let root = TempDir::new().expect("tempdir");
    let cache = file_cache(&root);
    let fingerprint = Fingerprint::compute(&canonical(&["1", "2"]), &config().identity);
    fs::create_dir_all(cache.directory()).expect("cache dir");
    fs::write(cache.entry_path(&fingerprint), b"{\"1\": {\"title\"").expect("write corrupt entry");

    let upstream = FakeUpstream::serving_documents();
    let extractor = extractor(config(), upstream.clone(), shared(&cache));

    // When: Extracting the same batch
    let result = extractor
        .extract(ids(&["1", "2"]), &CancellationToken::new())
        .await;

    // Then: The upstream was asked and a valid entry replaced the corrupt one
    assert_eq!(result.stats.cache_hits, 0);
    assert_eq!(result.stats.success, 2);
    assert_eq!(upstream.request_count(), 1);
    let entry = cache.get(&fingerprint).expect("entry rewritten");
    assert_eq!(entry.records.len(), 2);
}
