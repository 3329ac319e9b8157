//! Cache-aside: the source is the source of truth and is written first.

use super::{CacheStrategy, StrategyCore, StrategyKind};
use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::Result;
use crate::observability::StrategyStats;
use crate::repository::WritableDataSource;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Writes and deletes go to the source first; the cache follows only once
/// the source has accepted the change.
pub struct CacheAsideStrategy<B: CacheBackend, S: WritableDataSource> {
    core: StrategyCore<B, S>,
}

impl<B: CacheBackend, S: WritableDataSource> CacheAsideStrategy<B, S> {
    pub fn new(client: CacheClient<B>, source: Arc<S>) -> Self {
        Self::from_core(StrategyCore::new(client, source))
    }

    pub(crate) fn from_core(core: StrategyCore<B, S>) -> Self {
        CacheAsideStrategy { core }
    }
}

impl<B: CacheBackend, S: WritableDataSource> CacheStrategy for CacheAsideStrategy<B, S> {
    type Value = S::Value;

    fn kind(&self) -> StrategyKind {
        StrategyKind::CacheAside
    }

    async fn read(&self, key: &str) -> Result<S::Value> {
        self.core.read_or_load(key).await
    }

    async fn write(&self, key: &str, value: &S::Value, ttl: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.source.store(key, value).await?;
            self.core.cache_write(key, value, ttl).await
        }
        .await;
        self.core.finish_write(key, start, result).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.source.remove(key).await?;
            self.core.cache_delete(key).await
        }
        .await;
        self.core.finish_delete(key, start, result).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.core.exists(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.core.clear().await
    }

    async fn stats(&self) -> StrategyStats {
        self.core.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::repository::InMemorySource;

    #[tokio::test]
    async fn test_source_failure_leaves_cache_untouched() {
        let source = Arc::new(InMemorySource::new());
        source.fail_writes(true);
        let strategy = CacheAsideStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
        );

        assert!(strategy.write("k", &1u32, None).await.is_err());
        assert!(!strategy.exists("k").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_write_then_read_hits_cache() {
        let source = Arc::new(InMemorySource::new());
        let strategy = CacheAsideStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
        );
        strategy.write("k", &9u32, None).await.expect("write");
        assert_eq!(source.get("k"), Some(9));
        assert_eq!(strategy.read("k").await.expect("read"), 9);
        assert_eq!(source.calls().load_one, 0);
        assert_eq!(strategy.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_cache_when_source_rejects() {
        let source = Arc::new(InMemorySource::new());
        let strategy = CacheAsideStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
        );
        strategy.write("k", &9u32, None).await.expect("write");
        source.fail_writes(true);
        assert!(strategy.delete("k").await.is_err());
        assert!(strategy.exists("k").await.expect("exists"));
    }
}
