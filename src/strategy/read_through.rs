//! Read-through: the cache fronts every read, writes go to both stores.

use super::{CacheStrategy, StrategyCore, StrategyKind};
use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::Result;
use crate::observability::StrategyStats;
use crate::repository::WritableDataSource;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache first on read. Writes and deletes hit the cache, then the source;
/// either failing fails the call.
pub struct ReadThroughStrategy<B: CacheBackend, S: WritableDataSource> {
    core: StrategyCore<B, S>,
}

impl<B: CacheBackend, S: WritableDataSource> ReadThroughStrategy<B, S> {
    pub fn new(client: CacheClient<B>, source: Arc<S>) -> Self {
        Self::from_core(StrategyCore::new(client, source))
    }

    pub(crate) fn from_core(core: StrategyCore<B, S>) -> Self {
        ReadThroughStrategy { core }
    }
}

impl<B: CacheBackend, S: WritableDataSource> CacheStrategy for ReadThroughStrategy<B, S> {
    type Value = S::Value;

    fn kind(&self) -> StrategyKind {
        StrategyKind::ReadThrough
    }

    async fn read(&self, key: &str) -> Result<S::Value> {
        self.core.read_or_load(key).await
    }

    async fn write(&self, key: &str, value: &S::Value, ttl: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.cache_write(key, value, ttl).await?;
            self.core.source.store(key, value).await
        }
        .await;
        self.core.finish_write(key, start, result).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.cache_delete(key).await?;
            self.core.source.remove(key).await
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
    use crate::error::Error;
    use crate::repository::InMemorySource;

    #[tokio::test]
    async fn test_write_updates_cache_and_source() {
        let source = Arc::new(InMemorySource::new());
        let strategy = ReadThroughStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
        );

        strategy
            .write("user:1", &"Alice".to_string(), None)
            .await
            .expect("write");
        assert_eq!(source.get("user:1"), Some("Alice".to_string()));
        assert_eq!(strategy.read("user:1").await.expect("read"), "Alice");
        assert_eq!(source.calls().load_one, 0);
        assert_eq!(strategy.stats().await.writes, 1);
    }

    #[tokio::test]
    async fn test_source_failure_fails_write_after_cache_write() {
        let source = Arc::new(InMemorySource::new());
        source.fail_writes(true);
        let strategy = ReadThroughStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
        );

        let err = strategy
            .write("k", &1u32, None)
            .await
            .expect_err("source down");
        assert!(matches!(err, Error::SourceError(_)));
        assert!(strategy.exists("k").await.expect("exists"));
        assert_eq!(strategy.stats().await.errors, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_from_both() {
        let source = Arc::new(InMemorySource::with_entries([("k", 1u32)]));
        let strategy = ReadThroughStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
        );
        strategy.read("k").await.expect("read");
        strategy.delete("k").await.expect("delete");
        assert!(!strategy.exists("k").await.expect("exists"));
        assert!(source.is_empty());
        assert_eq!(strategy.stats().await.deletes, 1);
    }
}
