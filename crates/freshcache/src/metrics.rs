//! Cache performance monitoring and metrics

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

/// Cache performance statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads that returned a value
    pub hits: u64,
    /// Reads that found nothing usable, invalidations included
    pub misses: u64,
    /// Reads whose dependency reported a change
    pub invalidations: u64,
    /// Payloads that failed to decode
    pub malformed: u64,
    /// Successful writes
    pub writes: u64,
    /// Backend failures swallowed by the facade
    pub store_errors: u64,
    /// Bytes handed to the store by the last write
    pub last_payload_bytes: u64,
    /// Average time to retrieve from cache (milliseconds)
    pub avg_retrieval_time_ms: f64,
    /// Average time to store in cache (milliseconds)
    pub avg_store_time_ms: f64,
    /// Timestamp of cache creation
    pub created_at: SystemTime,
}

impl CacheStats {
    /// Calculate hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage (0.0 to 100.0)
    pub fn miss_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            100.0 - self.hit_rate()
        }
    }

    /// Share of reads lost to dependency changes, as a percentage
    pub fn invalidation_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.invalidations as f64 / total as f64) * 100.0
        }
    }

    /// Get uptime since cache creation
    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or(Duration::from_secs(0))
    }
}

/// Thread-safe cache metrics tracker
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    invalidations: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    store_errors: Arc<AtomicU64>,
    last_payload_bytes: Arc<AtomicU64>,
    total_retrieval_time_us: Arc<AtomicU64>,
    total_store_time_us: Arc<AtomicU64>,
    reads: Arc<AtomicU64>,
    created_at: SystemTime,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            invalidations: Arc::new(AtomicU64::new(0)),
            malformed: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
            store_errors: Arc::new(AtomicU64::new(0)),
            last_payload_bytes: Arc::new(AtomicU64::new(0)),
            total_retrieval_time_us: Arc::new(AtomicU64::new(0)),
            total_store_time_us: Arc::new(AtomicU64::new(0)),
            reads: Arc::new(AtomicU64::new(0)),
            created_at: SystemTime::now(),
        }
    }

    pub fn record_hit(&self, elapsed: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record_read(elapsed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_read(elapsed);
    }

    /// A dependency changed; the read itself is counted by `record_miss`
    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, elapsed: Duration, payload_bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.last_payload_bytes
            .store(payload_bytes as u64, Ordering::Relaxed);
        self.total_store_time_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_read(&self, elapsed: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.total_retrieval_time_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> CacheStats {
        let reads = self.reads.load(Ordering::Relaxed);
        let writes = self.writes.load(Ordering::Relaxed);
        let average_ms = |total_us: u64, count: u64| {
            if count == 0 {
                0.0
            } else {
                total_us as f64 / count as f64 / 1000.0
            }
        };

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            writes,
            store_errors: self.store_errors.load(Ordering::Relaxed),
            last_payload_bytes: self.last_payload_bytes.load(Ordering::Relaxed),
            avg_retrieval_time_ms: average_ms(
                self.total_retrieval_time_us.load(Ordering::Relaxed),
                reads,
            ),
            avg_store_time_ms: average_ms(self.total_store_time_us.load(Ordering::Relaxed), writes),
            created_at: self.created_at,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.invalidations,
            &self.malformed,
            &self.writes,
            &self.store_errors,
            &self.last_payload_bytes,
            &self.total_retrieval_time_us,
            &self.total_store_time_us,
            &self.reads,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get a formatted summary of cache metrics
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Cache Metrics:\n  Hits: {}\n  Misses: {}\n  Hit Rate: {:.2}%\n  Invalidations: {}\n  Malformed: {}\n  Writes: {}\n  Store Errors: {}\n  Avg Retrieval: {:.2}ms\n  Avg Store: {:.2}ms",
            stats.hits,
            stats.misses,
            stats.hit_rate(),
            stats.invalidations,
            stats.malformed,
            stats.writes,
            stats.store_errors,
            stats.avg_retrieval_time_ms,
            stats.avg_store_time_ms,
        )
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

/// Operation timing helper
#[derive(Debug)]
pub struct OperationTimer {
    start_time: std::time::Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn start() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
