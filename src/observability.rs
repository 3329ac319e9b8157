//! Statistics and metrics for cache operations.
//!
//! Two kinds of numbers are tracked:
//!
//! - **[`StrategyStats`]**: per-strategy counters and average latencies,
//!   updated on every strategy operation.
//! - **[`ReloadMetrics`]**: per-reloader counts, average reload duration and
//!   cache hit rate.
//!
//! Both average incrementally (`avg = (avg*(n-1) + new)/n`) so no history
//! is kept.
//!
//! The [`CacheMetrics`] trait is the seam for external telemetry. Strategies
//! call it on every operation; the default [`NoOpMetrics`] does nothing.
//!
//! ```ignore
//! use cache_engine::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         // counter!("cache_hits").inc();
//!     }
//! }
//!
//! // let service = CacheServiceBuilder::new(backend, source)
//! //     .with_metrics(Arc::new(PrometheusMetrics))
//! //     .build()
//! //     .await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trait for cache metrics collection.
///
/// Default methods log through the `log` crate.
pub trait CacheMetrics: Send + Sync {
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Debug, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Logs every event at debug level (errors at warn).
#[derive(Clone, Debug, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}

fn running_average(avg: Duration, count: u64, sample: Duration) -> Duration {
    if count <= 1 {
        return sample;
    }
    let n = count as u128;
    let nanos = (avg.as_nanos() * (n - 1) + sample.as_nanos()) / n;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Counters and average latencies for one strategy instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub errors: u64,
    pub avg_read_time: Duration,
    pub avg_write_time: Duration,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip)]
    reads_timed: u64,
}

impl StrategyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&mut self, elapsed: Duration) {
        self.hits += 1;
        self.record_read_time(elapsed);
    }

    pub fn record_miss(&mut self, elapsed: Duration) {
        self.misses += 1;
        self.record_read_time(elapsed);
    }

    pub fn record_write(&mut self, elapsed: Duration) {
        self.writes += 1;
        self.avg_write_time = running_average(self.avg_write_time, self.writes, elapsed);
        self.touch();
    }

    pub fn record_delete(&mut self) {
        self.deletes += 1;
        self.touch();
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
        self.touch();
    }

    /// Fraction of reads served from the cache, 0.0 before any read.
    pub fn hit_rate(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn record_read_time(&mut self, elapsed: Duration) {
        self.reads_timed += 1;
        self.avg_read_time = running_average(self.avg_read_time, self.reads_timed, elapsed);
        self.touch();
    }

    fn touch(&mut self) {
        self.last_used = Some(Utc::now());
    }
}

/// Counts and timings for one reloader.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadMetrics {
    pub total_reloads: u64,
    pub successful_reloads: u64,
    pub failed_reloads: u64,
    pub avg_reload_duration: Duration,
    pub last_reload: Option<DateTime<Utc>>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ReloadMetrics {
    /// Record one reload call (single, batch or full).
    pub fn record_reload(&mut self, success: bool, elapsed: Duration) {
        self.total_reloads += 1;
        if success {
            self.successful_reloads += 1;
        } else {
            self.failed_reloads += 1;
        }
        self.avg_reload_duration =
            running_average(self.avg_reload_duration, self.total_reloads, elapsed);
        self.last_reload = Some(Utc::now());
    }

    pub fn record_cache_access(&mut self, hit: bool) {
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
    }

    /// Fraction of tracked accesses that hit, 0.0 before any access.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
