use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counters accumulated over one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    /// Valid, unique identifiers after normalization.
    pub total_requested: usize,
    pub success: usize,
    pub fallback: usize,
    /// Identifiers that fell back because of a failure (cancellation excluded).
    pub errors: usize,
    /// Inputs dropped during normalization.
    pub invalid: usize,
    pub api_calls: u64,
    /// Identifiers served from cache.
    pub cache_hits: usize,
    pub retries: u64,
    pub batches: usize,
    pub duration_ms: u64,
    pub success_rate: f64,
    pub cancelled: bool,
}

impl BatchStatistics {
    pub fn new(total_requested: usize, invalid: usize) -> Self {
        Self {
            total_requested,
            invalid,
            ..Self::default()
        }
    }

    /// Fix the duration and derived rate once the run is over.
    pub fn finish(&mut self, elapsed: Duration) {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.success_rate = self.accounted_rate();
    }

    /// `(success + fallback) / total_requested`; `0.0` when nothing was
    /// requested.
    pub fn accounted_rate(&self) -> f64 {
        if self.total_requested == 0 {
            return 0.0;
        }
        (self.success + self.fallback) as f64 / self.total_requested as f64
    }

    /// Every requested identifier has exactly one outcome.
    pub fn is_complete(&self) -> bool {
        self.success + self.fallback == self.total_requested
    }
}
