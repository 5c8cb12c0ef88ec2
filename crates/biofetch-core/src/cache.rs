//! TTL caches for batch responses.
//!
//! A cache entry maps one batch [`Fingerprint`] to the records the upstream
//! returned for that batch. Three backends share the [`CacheBackend`]
//! contract:
//!
//! | Backend | Scope | Notes |
//! |---------|-------|-------|
//! | [`MemoryCache`] | process | bounded, least-recently-used eviction |
//! | [`FileCache`] | cross-run | one `{sha256}.json` per batch, atomic writes |
//! | [`TieredCache`] | both | memory in front of file |
//!
//! Expired, unreadable or corrupt entries are deleted and reported as a miss;
//! `get` never fails.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::fingerprint::{CacheContext, Fingerprint};
use crate::identifier::CanonicalId;

/// Records of one batch keyed by canonical identifier.
pub type CachedRecords = BTreeMap<CanonicalId, Value>;

/// Environment variable that overrides the cache root directory.
pub const CACHE_DIR_ENV: &str = "BIOFETCH_CACHE_DIR";

/// Cache failures. Internal: reads degrade to a miss and the extractor logs
/// and ignores write failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt cache entry at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which backend to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    #[default]
    File,
    Tiered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackendKind,
    /// Entry lifetime; zero or negative disables expiry.
    pub ttl_seconds: i64,
    /// Entry bound of the in-memory backend.
    pub max_size: usize,
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::File,
            ttl_seconds: 86_400,
            max_size: 1_024,
            directory: None,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        u64::try_from(self.ttl_seconds)
            .ok()
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }

    /// Cache root: `$BIOFETCH_CACHE_DIR`, then the configured directory, then
    /// `$HOME/.biofetch/cache`.
    pub fn root_directory(&self) -> PathBuf {
        if let Some(path) = env::var_os(CACHE_DIR_ENV) {
            let path = PathBuf::from(path);
            if !path.as_os_str().is_empty() {
                return path;
            }
        }

        if let Some(directory) = &self.directory {
            return directory.clone();
        }

        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(".biofetch").join("cache");
        }

        PathBuf::from(".biofetch").join("cache")
    }
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub records: CachedRecords,
    pub written_at: SystemTime,
}

/// Shared cache contract. Implementations are internally synchronized.
pub trait CacheBackend: Send + Sync {
    fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry>;

    fn set(&self, fingerprint: &Fingerprint, records: &CachedRecords) -> Result<(), CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str;
}

/// Build the configured backend, or `None` when caching is disabled.
pub fn build_cache(config: &CacheConfig, context: &CacheContext) -> Option<Arc<dyn CacheBackend>> {
    if !config.enabled {
        return None;
    }

    let ttl = config.ttl();
    let directory = context.directory(&config.root_directory());
    let cache: Arc<dyn CacheBackend> = match config.backend {
        CacheBackendKind::Memory => Arc::new(MemoryCache::new(config.max_size, ttl)),
        CacheBackendKind::File => Arc::new(FileCache::new(directory, ttl)),
        CacheBackendKind::Tiered => Arc::new(TieredCache::new(
            MemoryCache::new(config.max_size, ttl),
            FileCache::new(directory, ttl),
        )),
    };
    Some(cache)
}

fn is_expired(age: Duration, ttl: Option<Duration>) -> bool {
    ttl.is_some_and(|ttl| age > ttl)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    records: CachedRecords,
    written_at: SystemTime,
    /// `None` never expires.
    expires_at: Option<Instant>,
    last_used: u64,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    map: HashMap<Fingerprint, MemoryEntry>,
    tick: u64,
}

impl MemoryInner {
    fn next_tick(&mut self) -> u64 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    fn evict_to(&mut self, max_size: usize) {
        while self.map.len() > max_size {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(fingerprint, _)| fingerprint.clone());
            match oldest {
                Some(fingerprint) => {
                    self.map.remove(&fingerprint);
                }
                None => break,
            }
        }
    }
}

/// Thread-safe bounded in-memory cache.
#[derive(Debug)]
pub struct MemoryCache {
    max_size: usize,
    ttl: Option<Duration>,
    inner: Mutex<MemoryInner>,
}

impl MemoryCache {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn clear_expired(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.map.len();
        let now = Instant::now();
        inner.map.retain(|_, entry| !entry.is_expired(now));
        before - inner.map.len()
    }

    /// Store an entry written at `written_at`. Its remaining lifetime is the
    /// TTL minus the age it already has.
    fn set_at(&self, fingerprint: &Fingerprint, records: &CachedRecords, written_at: SystemTime) {
        let age = SystemTime::now()
            .duration_since(written_at)
            .unwrap_or(Duration::ZERO);
        let now = Instant::now();
        let expires_at = match self.ttl {
            Some(ttl) if age > ttl => return,
            Some(ttl) => now.checked_add(ttl - age),
            None => None,
        };

        let mut inner = self.lock();
        let tick = inner.next_tick();
        inner.map.insert(
            fingerprint.clone(),
            MemoryEntry {
                records: records.clone(),
                written_at,
                expires_at,
                last_used: tick,
            },
        );
        inner.evict_to(self.max_size);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory cache lock is not poisoned")
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let expired = inner.map.get(fingerprint)?.is_expired(Instant::now());
        if expired {
            inner.map.remove(fingerprint);
            return None;
        }

        let tick = inner.next_tick();
        let entry = inner.map.get_mut(fingerprint)?;
        entry.last_used = tick;
        Some(CacheEntry {
            records: entry.records.clone(),
            written_at: entry.written_at,
        })
    }

    fn set(&self, fingerprint: &Fingerprint, records: &CachedRecords) -> Result<(), CacheError> {
        self.set_at(fingerprint, records, SystemTime::now());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.lock().map.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.lock().map.len()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// File-backed cache persisted across runs.
///
/// The entry's write time is the file modification time. Writes land in a
/// temporary file in the same directory and are renamed into place, so
/// readers see either the old entry, the new one, or none.
#[derive(Debug, Clone)]
pub struct FileCache {
    directory: PathBuf,
    ttl: Option<Duration>,
}

impl FileCache {
    pub fn new(directory: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            directory: directory.into(),
            ttl,
        }
    }

    pub fn for_context(root: &Path, context: &CacheContext, ttl: Option<Duration>) -> Self {
        Self::new(context.directory(root), ttl)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.directory.join(fingerprint.file_name())
    }

    fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(CacheError::io(path, error)),
        };
        let written_at = metadata
            .modified()
            .map_err(|error| CacheError::io(path, error))?;

        let age = SystemTime::now()
            .duration_since(written_at)
            .unwrap_or(Duration::ZERO);
        if is_expired(age, self.ttl) {
            tracing::debug!(path = %path.display(), age_s = age.as_secs(), "cache entry expired");
            remove_quietly(path);
            return Ok(None);
        }

        let text = fs::read_to_string(path).map_err(|error| CacheError::io(path, error))?;
        let records: CachedRecords =
            serde_json::from_str(&text).map_err(|error| CacheError::Corrupt {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })?;

        Ok(Some(CacheEntry {
            records,
            written_at,
        }))
    }
}

impl CacheBackend for FileCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let path = self.entry_path(fingerprint);
        match self.read_entry(&path) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(%error, "discarding unreadable cache entry");
                remove_quietly(&path);
                None
            }
        }
    }

    fn set(&self, fingerprint: &Fingerprint, records: &CachedRecords) -> Result<(), CacheError> {
        fs::create_dir_all(&self.directory)
            .map_err(|error| CacheError::io(&self.directory, error))?;

        let path = self.entry_path(fingerprint);
        let mut temp = NamedTempFile::new_in(&self.directory)
            .map_err(|error| CacheError::io(&self.directory, error))?;
        serde_json::to_writer(&mut temp, records)?;
        temp.flush().map_err(|error| CacheError::io(temp.path(), error))?;
        temp.persist(&path)
            .map_err(|error| CacheError::io(&path, error.error))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.directory) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(CacheError::io(&self.directory, error)),
        }
    }

    fn len(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.directory) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(Fingerprint::from_hex)
                    .is_some()
                    && entry.path().extension().is_some_and(|ext| ext == "json")
            })
            .count()
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Memory cache in front of a file cache. File hits are promoted and keep
/// the file's write time, so promotion never extends an entry's lifetime.
#[derive(Debug)]
pub struct TieredCache {
    memory: MemoryCache,
    file: FileCache,
}

impl TieredCache {
    pub fn new(memory: MemoryCache, file: FileCache) -> Self {
        Self { memory, file }
    }
}

impl CacheBackend for TieredCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.get(fingerprint) {
            return Some(entry);
        }

        let entry = self.file.get(fingerprint)?;
        self.memory
            .set_at(fingerprint, &entry.records, entry.written_at);
        Some(entry)
    }

    fn set(&self, fingerprint: &Fingerprint, records: &CachedRecords) -> Result<(), CacheError> {
        self.file.set(fingerprint, records)?;
        self.memory.set_at(fingerprint, records, SystemTime::now());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.memory.clear()?;
        self.file.clear()
    }

    fn len(&self) -> usize {
        self.file.len()
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}

fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "failed to remove cache entry");
        }
    }
}
