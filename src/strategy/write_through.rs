//! Write-through: every write is synchronous to cache and source.

use super::{CacheStrategy, StrategyCore, StrategyKind};
use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::{Error, Result};
use crate::observability::StrategyStats;
use crate::repository::WritableDataSource;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Writes hit cache and source before returning. If either fails the whole
/// write fails; the cache entry is dropped when the source rejects the
/// write so readers fall back to the source's current value.
pub struct WriteThroughStrategy<B: CacheBackend, S: WritableDataSource> {
    core: StrategyCore<B, S>,
}

impl<B: CacheBackend, S: WritableDataSource> WriteThroughStrategy<B, S> {
    pub fn new(client: CacheClient<B>, source: Arc<S>) -> Self {
        Self::from_core(StrategyCore::new(client, source))
    }

    pub(crate) fn from_core(core: StrategyCore<B, S>) -> Self {
        WriteThroughStrategy { core }
    }
}

impl<B: CacheBackend, S: WritableDataSource> CacheStrategy for WriteThroughStrategy<B, S> {
    type Value = S::Value;

    fn kind(&self) -> StrategyKind {
        StrategyKind::WriteThrough
    }

    async fn read(&self, key: &str) -> Result<S::Value> {
        self.core.read_or_load(key).await
    }

    async fn write(&self, key: &str, value: &S::Value, ttl: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.cache_write(key, value, ttl).await?;
            if let Err(e) = self.core.source.store(key, value).await {
                if let Err(cleanup) = self.core.cache_delete(key).await {
                    warn!("⚠ Failed to drop cache entry {} after source error: {}", key, cleanup);
                }
                return Err(e);
            }
            Ok::<(), Error>(())
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
