use serde::Serialize;

use crate::identifier::CanonicalId;
use crate::ValidationError;

/// Default number of identifiers per upstream request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 25;

/// Hard ceiling imposed by upstream URL-length limits.
pub const MAX_BATCH_SIZE_LIMIT: usize = 100;

/// Ordered, deduplicated group of identifiers sent in one upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestBatch {
    index: usize,
    ids: Vec<CanonicalId>,
}

impl RequestBatch {
    /// Build a batch. `ids` are sorted and deduplicated; the result must be
    /// non-empty and no larger than `max_size`.
    pub fn new(
        index: usize,
        mut ids: Vec<CanonicalId>,
        max_size: usize,
    ) -> Result<Self, ValidationError> {
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if ids.len() > max_size {
            return Err(ValidationError::BatchTooLarge {
                len: ids.len(),
                max: max_size,
            });
        }

        Ok(Self { index, ids })
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub fn ids(&self) -> &[CanonicalId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Comma-joined form used for `*__in` filter parameters.
    pub fn joined(&self) -> String {
        self.ids
            .iter()
            .map(CanonicalId::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Partition sorted, unique identifiers into batches of at most `max_size`.
pub fn partition(ids: &[CanonicalId], max_size: usize) -> Vec<RequestBatch> {
    let size = max_size.max(1);
    ids.chunks(size)
        .enumerate()
        .filter_map(|(index, chunk)| RequestBatch::new(index, chunk.to_vec(), size).ok())
        .collect()
}
