use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one [`ChunkCache`](crate::ChunkCache)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Stages served from a complete entry
    pub hits: u64,
    /// Stages computed and persisted
    pub misses: u64,
    /// Incomplete or unreadable entries deleted before recomputing
    pub discarded: u64,
    /// Stages wrapped with `active = false`
    pub passthrough: u64,
    /// Wall-clock time spent computing missed stages
    pub computation_time: Duration,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
    passthrough: AtomicU64,
    computation_nanos: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_hit(&self, stage: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::increment_counter!("chunkcache_hits_total", "stage" => stage.to_string());
        #[cfg(not(feature = "metrics"))]
        let _ = stage;
    }

    pub(crate) fn record_miss(&self, stage: &str, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.computation_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            metrics::increment_counter!("chunkcache_misses_total", "stage" => stage.to_string());
            metrics::histogram!(
                "chunkcache_computation_seconds",
                elapsed.as_secs_f64(),
                "stage" => stage.to_string()
            );
        }
        #[cfg(not(feature = "metrics"))]
        let _ = stage;
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::increment_counter!("chunkcache_discarded_total");
    }

    pub(crate) fn record_passthrough(&self) {
        self.passthrough.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            computation_time: Duration::from_nanos(self.computation_nanos.load(Ordering::Relaxed)),
        }
    }
}
