//! Read/write policies over the cache and a data source.
//!
//! Four interchangeable strategies share one contract, [`CacheStrategy`]:
//!
//! | Strategy | Read miss | Write | Delete |
//! |----------|-----------|-------|--------|
//! | **ReadThrough** | load from source, populate | cache, then source | cache, then source |
//! | **WriteThrough** | load from source, populate | cache, then source | cache, then source |
//! | **WriteBehind** | load from source, populate | cache now, source queued | cache now, source queued |
//! | **CacheAside** | load from source, populate | source, then cache | source, then cache |
//!
//! Cache population after a source load is best effort: a failed cache
//! write is logged and the loaded value is still returned.
//!
//! Select one with [`StrategyKind`]; [`Strategy`] is the closed set the
//! service dispatches through.
//!
//! ```
//! use cache_engine::strategy::StrategyKind;
//!
//! let kind: StrategyKind = "write-behind".parse().unwrap();
//! assert_eq!(kind, StrategyKind::WriteBehind);
//! assert_eq!(kind.to_string(), "write_behind");
//! assert_eq!(StrategyKind::default(), StrategyKind::ReadThrough);
//! ```

mod cache_aside;
mod read_through;
mod write_behind;
mod write_through;

pub use cache_aside::CacheAsideStrategy;
pub use read_through::ReadThroughStrategy;
pub use write_behind::{WriteBehindStrategy, DEFAULT_QUEUE_CAPACITY};
pub use write_through::WriteThroughStrategy;

use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::{Error, Result};
use crate::observability::{CacheMetrics, NoOpMetrics, StrategyStats};
use crate::repository::WritableDataSource;
use crate::serialization::CacheValue;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Which read/write policy a strategy implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StrategyKind {
    /// Cache first on read; writes go to cache and source together.
    #[default]
    ReadThrough,

    /// Writes are synchronous to cache and source; either failing fails
    /// the write.
    WriteThrough,

    /// Writes hit the cache synchronously; the source write is queued for a
    /// background worker.
    WriteBehind,

    /// The source is written first and is the source of truth.
    CacheAside,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::ReadThrough,
        StrategyKind::WriteThrough,
        StrategyKind::WriteBehind,
        StrategyKind::CacheAside,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ReadThrough => "read_through",
            StrategyKind::WriteThrough => "write_through",
            StrategyKind::WriteBehind => "write_behind",
            StrategyKind::CacheAside => "cache_aside",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    /// Accepts `read_through`, `read-through`, `ReadThrough` and so on.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "readthrough" => Ok(StrategyKind::ReadThrough),
            "writethrough" => Ok(StrategyKind::WriteThrough),
            "writebehind" => Ok(StrategyKind::WriteBehind),
            "cacheaside" => Ok(StrategyKind::CacheAside),
            _ => Err(Error::ConfigError(format!("unknown cache strategy: {}", s))),
        }
    }
}

/// Contract shared by every strategy.
pub trait CacheStrategy: Send + Sync {
    type Value: CacheValue;

    fn kind(&self) -> StrategyKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Read a value, falling back to the data source on a miss.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`: neither the cache nor the source has the key
    /// - `Error::SourceError`: the source load failed
    /// - `Error::DeserializationError`: the cached bytes are malformed
    fn read(&self, key: &str) -> impl Future<Output = Result<Self::Value>> + Send;

    /// Write a value. `ttl` of `None` uses the strategy's default TTL.
    fn write(
        &self,
        key: &str,
        value: &Self::Value,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Whether the key is currently cached (the source is not consulted).
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Empty the cache database.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    /// Snapshot of this instance's counters.
    fn stats(&self) -> impl Future<Output = StrategyStats> + Send;
}

/// State and read path shared by all four strategies.
pub(crate) struct StrategyCore<B: CacheBackend, S: WritableDataSource> {
    pub(crate) client: CacheClient<B>,
    pub(crate) source: Arc<S>,
    stats: Arc<RwLock<StrategyStats>>,
    metrics: Arc<dyn CacheMetrics>,
    default_ttl: Option<Duration>,
}

impl<B: CacheBackend, S: WritableDataSource> Clone for StrategyCore<B, S> {
    fn clone(&self) -> Self {
        StrategyCore {
            client: self.client.clone(),
            source: Arc::clone(&self.source),
            stats: Arc::clone(&self.stats),
            metrics: Arc::clone(&self.metrics),
            default_ttl: self.default_ttl,
        }
    }
}

impl<B: CacheBackend, S: WritableDataSource> StrategyCore<B, S> {
    pub(crate) fn new(client: CacheClient<B>, source: Arc<S>) -> Self {
        StrategyCore {
            client,
            source,
            stats: Arc::new(RwLock::new(StrategyStats::new())),
            metrics: Arc::new(NoOpMetrics),
            default_ttl: None,
        }
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub(crate) fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub(crate) fn ttl_or_default(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.default_ttl)
    }

    /// Cache first; on a miss load from the source and populate.
    pub(crate) async fn read_or_load(&self, key: &str) -> Result<S::Value> {
        let start = Instant::now();
        match self.client.get::<S::Value>(key).await {
            Ok(value) => {
                let elapsed = start.elapsed();
                self.stats.write().await.record_hit(elapsed);
                self.metrics.record_hit(key, elapsed);
                return Ok(value);
            }
            Err(e) if e.is_cache_miss() => {}
            Err(e) => return Err(self.fail(key, e).await),
        }

        let loaded = match self.source.load_one(key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.record_miss(key, start.elapsed()).await;
                return Err(Error::NotFound(key.to_string()));
            }
            Err(e) => return Err(self.fail(key, e).await),
        };

        if let Err(e) = self.client.set(key, &loaded, self.default_ttl).await {
            warn!("⚠ Failed to populate cache for {} after source load: {}", key, e);
        }
        self.record_miss(key, start.elapsed()).await;
        Ok(loaded)
    }

    pub(crate) async fn cache_write(
        &self,
        key: &str,
        value: &S::Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.client.set(key, value, self.ttl_or_default(ttl)).await
    }

    pub(crate) async fn cache_delete(&self, key: &str) -> Result<()> {
        self.client.delete(key).await.map(|_| ())
    }

    pub(crate) async fn exists(&self, key: &str) -> Result<bool> {
        self.client.exists(key).await
    }

    pub(crate) async fn clear(&self) -> Result<()> {
        self.client.flush_db().await
    }

    pub(crate) async fn stats(&self) -> StrategyStats {
        self.stats.read().await.clone()
    }

    pub(crate) async fn record_write(&self, key: &str, elapsed: Duration) {
        self.stats.write().await.record_write(elapsed);
        self.metrics.record_set(key, elapsed);
    }

    pub(crate) async fn record_delete(&self, key: &str, elapsed: Duration) {
        self.stats.write().await.record_delete();
        self.metrics.record_delete(key, elapsed);
    }

    async fn record_miss(&self, key: &str, elapsed: Duration) {
        self.stats.write().await.record_miss(elapsed);
        self.metrics.record_miss(key, elapsed);
    }

    /// Count an error and hand it back.
    pub(crate) async fn fail(&self, key: &str, error: Error) -> Error {
        self.stats.write().await.record_error();
        self.metrics.record_error(key, &error.to_string());
        error
    }

    /// Record the outcome of a write-side operation.
    pub(crate) async fn finish_write(
        &self,
        key: &str,
        start: Instant,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.record_write(key, start.elapsed()).await;
                Ok(())
            }
            Err(e) => Err(self.fail(key, e).await),
        }
    }

    pub(crate) async fn finish_delete(
        &self,
        key: &str,
        start: Instant,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.record_delete(key, start.elapsed()).await;
                Ok(())
            }
            Err(e) => Err(self.fail(key, e).await),
        }
    }
}

/// The closed set of strategies a service dispatches through.
pub enum Strategy<B: CacheBackend, S: WritableDataSource> {
    ReadThrough(ReadThroughStrategy<B, S>),
    WriteThrough(WriteThroughStrategy<B, S>),
    WriteBehind(WriteBehindStrategy<B, S>),
    CacheAside(CacheAsideStrategy<B, S>),
}

impl<B: CacheBackend, S: WritableDataSource> Strategy<B, S> {
    /// Build a strategy of `kind`.
    ///
    /// A write-behind strategy spawns its worker immediately and must be
    /// created inside a Tokio runtime.
    pub fn new(
        kind: StrategyKind,
        client: CacheClient<B>,
        source: Arc<S>,
        default_ttl: Option<Duration>,
        metrics: Arc<dyn CacheMetrics>,
        queue_capacity: usize,
    ) -> Self {
        let core = StrategyCore::new(client, source)
            .with_default_ttl(default_ttl)
            .with_metrics(metrics);
        match kind {
            StrategyKind::ReadThrough => Strategy::ReadThrough(ReadThroughStrategy::from_core(core)),
            StrategyKind::WriteThrough => {
                Strategy::WriteThrough(WriteThroughStrategy::from_core(core))
            }
            StrategyKind::WriteBehind => {
                Strategy::WriteBehind(WriteBehindStrategy::from_core(core, queue_capacity))
            }
            StrategyKind::CacheAside => Strategy::CacheAside(CacheAsideStrategy::from_core(core)),
        }
    }

    /// Stop any background work. Only write-behind has some; `flush`
    /// applies its queued writes first, otherwise they are dropped and the
    /// count is logged.
    pub async fn shutdown(&self, flush: bool) -> usize {
        match self {
            Strategy::WriteBehind(s) => s.shutdown(flush).await,
            _ => 0,
        }
    }
}

impl<B: CacheBackend, S: WritableDataSource> CacheStrategy for Strategy<B, S> {
    type Value = S::Value;

    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::ReadThrough(s) => s.kind(),
            Strategy::WriteThrough(s) => s.kind(),
            Strategy::WriteBehind(s) => s.kind(),
            Strategy::CacheAside(s) => s.kind(),
        }
    }

    async fn read(&self, key: &str) -> Result<S::Value> {
        match self {
            Strategy::ReadThrough(s) => s.read(key).await,
            Strategy::WriteThrough(s) => s.read(key).await,
            Strategy::WriteBehind(s) => s.read(key).await,
            Strategy::CacheAside(s) => s.read(key).await,
        }
    }

    async fn write(&self, key: &str, value: &S::Value, ttl: Option<Duration>) -> Result<()> {
        match self {
            Strategy::ReadThrough(s) => s.write(key, value, ttl).await,
            Strategy::WriteThrough(s) => s.write(key, value, ttl).await,
            Strategy::WriteBehind(s) => s.write(key, value, ttl).await,
            Strategy::CacheAside(s) => s.write(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Strategy::ReadThrough(s) => s.delete(key).await,
            Strategy::WriteThrough(s) => s.delete(key).await,
            Strategy::WriteBehind(s) => s.delete(key).await,
            Strategy::CacheAside(s) => s.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Strategy::ReadThrough(s) => s.exists(key).await,
            Strategy::WriteThrough(s) => s.exists(key).await,
            Strategy::WriteBehind(s) => s.exists(key).await,
            Strategy::CacheAside(s) => s.exists(key).await,
        }
    }

    async fn clear(&self) -> Result<()> {
        match self {
            Strategy::ReadThrough(s) => s.clear().await,
            Strategy::WriteThrough(s) => s.clear().await,
            Strategy::WriteBehind(s) => s.clear().await,
            Strategy::CacheAside(s) => s.clear().await,
        }
    }

    async fn stats(&self) -> StrategyStats {
        match self {
            Strategy::ReadThrough(s) => s.stats().await,
            Strategy::WriteThrough(s) => s.stats().await,
            Strategy::WriteBehind(s) => s.stats().await,
            Strategy::CacheAside(s) => s.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::repository::InMemorySource;

    #[test]
    fn test_strategy_kind_display_and_parse() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse::<StrategyKind>().expect("parse"), kind);
        }
        assert_eq!(
            "Cache-Aside".parse::<StrategyKind>().expect("parse"),
            StrategyKind::CacheAside
        );
        assert!(matches!(
            "write_around".parse::<StrategyKind>(),
            Err(Error::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_every_kind_reads_through_on_miss() {
        for kind in StrategyKind::ALL {
            let backend = InMemoryBackend::new();
            let source = Arc::new(InMemorySource::with_entries([("k", 7u32)]));
            let strategy = Strategy::new(
                kind,
                CacheClient::new(backend.clone()),
                Arc::clone(&source),
                None,
                Arc::new(NoOpMetrics),
                DEFAULT_QUEUE_CAPACITY,
            );

            assert_eq!(strategy.kind(), kind);
            assert_eq!(strategy.read("k").await.expect("read"), 7);
            assert!(strategy.exists("k").await.expect("exists"), "{kind}");
            assert_eq!(strategy.read("k").await.expect("read"), 7);
            assert_eq!(source.calls().load_one, 1, "{kind}: second read is a hit");

            let stats = strategy.stats().await;
            assert_eq!((stats.hits, stats.misses), (1, 1));
            strategy.shutdown(true).await;
        }
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_not_found() {
        let strategy = Strategy::new(
            StrategyKind::ReadThrough,
            CacheClient::new(InMemoryBackend::new()),
            Arc::new(InMemorySource::<u32>::new()),
            None,
            Arc::new(NoOpMetrics),
            DEFAULT_QUEUE_CAPACITY,
        );
        let err = strategy.read("nope").await.expect_err("absent");
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(strategy.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_source_error_propagates_and_counts() {
        let source = Arc::new(InMemorySource::with_entries([("k", 1u32)]));
        source.fail_key("k");
        let strategy = Strategy::new(
            StrategyKind::CacheAside,
            CacheClient::new(InMemoryBackend::new()),
            source,
            None,
            Arc::new(NoOpMetrics),
            DEFAULT_QUEUE_CAPACITY,
        );
        let err = strategy.read("k").await.expect_err("source fails");
        assert!(matches!(err, Error::SourceError(_)));
        assert_eq!(strategy.stats().await.errors, 1);
    }

    #[tokio::test]
    async fn test_population_failure_still_returns_value() {
        let client = CacheClient::new(InMemoryBackend::new());
        client.transformers().add(Arc::new(
            crate::transformers::ValidationTransformer::new().with_max_size(0),
        ));
        let strategy = Strategy::new(
            StrategyKind::ReadThrough,
            client,
            Arc::new(InMemorySource::with_entries([("k", 5u32)])),
            None,
            Arc::new(NoOpMetrics),
            DEFAULT_QUEUE_CAPACITY,
        );

        assert_eq!(strategy.read("k").await.expect("read"), 5);
        assert!(!strategy.exists("k").await.expect("exists"));
    }
}
