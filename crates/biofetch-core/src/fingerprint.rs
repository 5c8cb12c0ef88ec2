//! Deterministic cache fingerprints.
//!
//! A fingerprint identifies one batch request in one data generation: the
//! sorted identifiers, the upstream release tag and the pipeline identity are
//! serialized canonically and hashed with SHA-256. The result depends on
//! nothing else (no process, machine or clock state).

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identifier::CanonicalId;

/// Pipeline identity and upstream release that scope a cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheContext {
    pub pipeline: String,
    pub pipeline_version: String,
    pub release: String,
}

impl CacheContext {
    pub fn new(
        pipeline: impl Into<String>,
        pipeline_version: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            pipeline_version: pipeline_version.into(),
            release: release.into(),
        }
    }

    /// `{root}/{pipeline}/{release}/{pipeline_version}`.
    ///
    /// Removing the release directory invalidates the whole generation.
    pub fn directory(&self, root: &Path) -> PathBuf {
        root.join(path_component(&self.pipeline))
            .join(path_component(&self.release))
            .join(path_component(&self.pipeline_version))
    }
}

/// SHA-256 hex digest identifying a cached batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of `ids` within `context`. Input order and
    /// duplicates do not matter.
    pub fn compute(ids: &[CanonicalId], context: &CacheContext) -> Self {
        let mut sorted: Vec<&str> = ids.iter().map(CanonicalId::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let material = FingerprintMaterial {
            ids: sorted,
            release: &context.release,
            pipeline: &context.pipeline,
            pipeline_version: &context.pipeline_version,
        };
        // Struct field order is fixed, so the JSON form is canonical.
        let canonical = serde_json::to_vec(&material).unwrap_or_default();
        Self(hex::encode(Sha256::digest(&canonical)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{sha256-hex}.json`.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Accepts only well-formed 64 character lowercase hex digests.
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        valid.then(|| Self(value.to_owned()))
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct FingerprintMaterial<'a> {
    ids: Vec<&'a str>,
    release: &'a str,
    pipeline: &'a str,
    pipeline_version: &'a str,
}

fn path_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => String::from("_"),
        _ => cleaned,
    }
}
