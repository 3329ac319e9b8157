//! The cache engine facade.
//!
//! [`CacheService`] composes the primitive client, the active strategy, the
//! reloader, the invalidator and the warmer behind one API. It is built
//! once at startup and cloned wherever it is needed; clones share
//! everything.
//!
//! ```
//! use cache_engine::backend::InMemoryBackend;
//! use cache_engine::repository::InMemorySource;
//! use cache_engine::{CacheService, EngineConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> cache_engine::Result<()> {
//! let source = Arc::new(InMemorySource::with_entries([("user:1", "alice".to_string())]));
//! let service = CacheService::new(InMemoryBackend::new(), source, EngineConfig::default()).await?;
//!
//! assert_eq!(service.read("user:1").await?, "alice");
//! assert!(service.exists("user:1").await?);
//! service.close().await;
//! # Ok(())
//! # }
//! ```

use crate::backend::{CacheBackend, KeyTtl};
use crate::builder::CacheServiceBuilder;
use crate::client::{Batch, CacheClient};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::hooks::{DataTransformer, HookManager, ReloadHook, TransformerManager};
use crate::invalidation::{CacheInvalidator, InvalidationEvent};
use crate::observability::{CacheMetrics, ReloadMetrics, StrategyStats};
use crate::reload::{CacheReloader, ReloadConfig, ReloadResult};
use crate::repository::{DataSource, WritableDataSource};
use crate::strategy::{CacheStrategy, Strategy, StrategyKind};
use crate::warming::{CacheWarmer, WarmUpResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[cfg(feature = "redis")]
use crate::backend::{RedisBackend, RedisConfig};

struct Inner<B: CacheBackend, S: WritableDataSource> {
    client: CacheClient<B>,
    source: Arc<S>,
    config: EngineConfig,
    metrics: Arc<dyn CacheMetrics>,
    strategy: RwLock<Strategy<B, S>>,
    reloader: CacheReloader<B, S>,
    invalidator: CacheInvalidator<B>,
    warmer: CacheWarmer<B, S>,
    hooks: Arc<HookManager<S::Value>>,
    transformers: Arc<TransformerManager>,
}

/// Single entry point to the engine.
pub struct CacheService<B: CacheBackend, S: WritableDataSource> {
    inner: Arc<Inner<B, S>>,
}

impl<B: CacheBackend, S: WritableDataSource> Clone for CacheService<B, S> {
    fn clone(&self) -> Self {
        CacheService {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: CacheBackend, S: WritableDataSource> CacheService<B, S> {
    /// Build a service with default metrics, no hooks and no transformers.
    ///
    /// Warms the cache first when `config.reload.enable_warm_up` is set and
    /// starts the reload scheduler when `enable_scheduled_reload` is set.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if `config` does not validate.
    pub async fn new(backend: B, source: Arc<S>, config: EngineConfig) -> Result<Self> {
        CacheServiceBuilder::new(backend, source)
            .with_config(config)
            .build()
            .await
    }

    /// Fluent construction.
    pub fn builder(backend: B, source: Arc<S>) -> CacheServiceBuilder<B, S> {
        CacheServiceBuilder::new(backend, source)
    }

    pub(crate) async fn assemble(
        backend: B,
        source: Arc<S>,
        config: EngineConfig,
        metrics: Arc<dyn CacheMetrics>,
        hooks: Vec<Arc<dyn ReloadHook<S::Value>>>,
        transformers: Vec<Arc<dyn DataTransformer>>,
    ) -> Result<Self> {
        config.validate()?;

        let transformer_manager = Arc::new(TransformerManager::new());
        for transformer in transformers {
            transformer_manager.add(transformer);
        }
        let hook_manager = Arc::new(HookManager::new());
        for hook in hooks {
            hook_manager.add(hook);
        }

        let client = CacheClient::new(backend)
            .with_codec(config.codec)
            .with_transformers(Arc::clone(&transformer_manager));

        let strategy = Strategy::new(
            config.strategy,
            client.clone(),
            Arc::clone(&source),
            config.default_ttl,
            Arc::clone(&metrics),
            config.write_behind_capacity,
        );
        let reloader = CacheReloader::with_hooks(
            client.clone(),
            Arc::clone(&source),
            config.reload.clone(),
            Arc::clone(&hook_manager),
        );
        let invalidator = CacheInvalidator::new(client.clone(), config.invalidation.clone());
        let warmer = CacheWarmer::new(reloader.clone());

        info!(
            "✓ Cache service ready (strategy {}, codec {:?})",
            config.strategy, config.codec
        );

        let service = CacheService {
            inner: Arc::new(Inner {
                client,
                source,
                config,
                metrics,
                strategy: RwLock::new(strategy),
                reloader,
                invalidator,
                warmer,
                hooks: hook_manager,
                transformers: transformer_manager,
            }),
        };

        if service.inner.config.reload.enable_warm_up {
            if let Err(e) = service.warm_up().await {
                warn!("⚠ Startup warm-up failed: {}", e);
            }
        }
        Ok(service)
    }

    /// The primitive client, for operations this facade does not wrap.
    pub fn client(&self) -> &CacheClient<B> {
        &self.inner.client
    }

    pub fn source(&self) -> &Arc<S> {
        &self.inner.source
    }

    /// The configuration the service was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // --------------------------------------------------------- primitives

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.inner.client.set(key, value, ttl).await
    }

    /// `Error::CacheMiss` when absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.inner.client.get(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.client.delete(key).await
    }

    /// Cursor-scan delete of every key matching a glob.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        self.inner.client.delete_pattern(pattern).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.client.exists(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.client.expire(key, ttl).await
    }

    pub async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.inner.client.ttl(key).await
    }

    pub async fn increment(&self, key: &str) -> Result<i64> {
        self.inner.client.increment(key).await
    }

    pub async fn increment_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.inner.client.increment_by(key, delta).await
    }

    pub async fn decrement(&self, key: &str) -> Result<i64> {
        self.inner.client.decrement(key).await
    }

    pub async fn decrement_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.inner.client.decrement_by(key, delta).await
    }

    pub async fn lpush<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64> {
        self.inner.client.lpush(key, values).await
    }

    pub async fn rpush<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64> {
        self.inner.client.rpush(key, values).await
    }

    pub async fn lrange<T: DeserializeOwned>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<T>> {
        self.inner.client.lrange(key, start, stop).await
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.inner.client.ltrim(key, start, stop).await
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        self.inner.client.llen(key).await
    }

    pub async fn lpop<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.inner.client.lpop(key).await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.inner.client.sadd(key, members).await
    }

    pub async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        self.inner.client.srem(key, members).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.client.smembers(key).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.client.sismember(key, member).await
    }

    pub async fn hset<T: Serialize>(&self, key: &str, field: &str, value: &T) -> Result<bool> {
        self.inner.client.hset(key, field, value).await
    }

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        self.inner.client.hget(key, field).await
    }

    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<String, T>> {
        self.inner.client.hgetall(key).await
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        self.inner.client.hdel(key, fields).await
    }

    pub async fn set_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.inner.client.set_if_absent(key, value, ttl).await
    }

    pub async fn set_if_present<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.inner.client.set_if_present(key, value, ttl).await
    }

    pub async fn compare_and_swap<T: Serialize + DeserializeOwned>(
        &self,
        key: &str,
        expected: &T,
        new: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.inner
            .client
            .compare_and_swap(key, expected, new, ttl)
            .await
    }

    pub fn pipeline(&self) -> Batch<'_, B> {
        self.inner.client.pipeline()
    }

    pub fn transaction(&self) -> Batch<'_, B> {
        self.inner.client.transaction()
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.inner.client.health_check().await
    }

    // ---------------------------------------------------------- strategy

    /// Read through the active strategy.
    pub async fn read(&self, key: &str) -> Result<S::Value> {
        self.inner.strategy.read().await.read(key).await
    }

    /// Write through the active strategy. `None` uses the default TTL.
    pub async fn write(&self, key: &str, value: &S::Value, ttl: Option<Duration>) -> Result<()> {
        self.inner.strategy.read().await.write(key, value, ttl).await
    }

    /// Delete through the active strategy.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner.strategy.read().await.delete(key).await
    }

    pub async fn strategy_kind(&self) -> StrategyKind {
        self.inner.strategy.read().await.kind()
    }

    /// Switch the active strategy. The previous one is shut down with
    /// flush once in-flight operations on it have finished. Stats start
    /// over.
    pub async fn set_strategy(&self, kind: StrategyKind) {
        let next = Strategy::new(
            kind,
            self.inner.client.clone(),
            Arc::clone(&self.inner.source),
            self.inner.config.default_ttl,
            Arc::clone(&self.inner.metrics),
            self.inner.config.write_behind_capacity,
        );
        let previous = {
            let mut active = self.inner.strategy.write().await;
            std::mem::replace(&mut *active, next)
        };
        let flushed = previous.shutdown(true).await;
        info!(
            "✓ Strategy switched {} -> {} ({} queued writes flushed)",
            previous.kind(),
            kind,
            flushed
        );
    }

    pub async fn strategy_stats(&self) -> StrategyStats {
        self.inner.strategy.read().await.stats().await
    }

    /// Cache first. On a miss with lazy loading enabled, reload the key
    /// and return the source value. Feeds the reloader's hit rate.
    ///
    /// # Errors
    ///
    /// - `Error::CacheMiss`: absent and lazy loading is disabled
    /// - `Error::NotFound`: absent from the source too
    /// - any reload error (`SourceError`, `ValidationError`, `HookError`)
    pub async fn get_or_load(&self, key: &str) -> Result<S::Value> {
        let reloader = &self.inner.reloader;
        match self.inner.client.get::<S::Value>(key).await {
            Ok(value) => {
                reloader.record_cache_access(true).await;
                return Ok(value);
            }
            Err(e) if e.is_cache_miss() => reloader.record_cache_access(false).await,
            Err(e) => return Err(e),
        }

        if !reloader.config().await.enable_lazy_loading {
            return Err(crate::Error::CacheMiss(key.to_string()));
        }

        reloader.reload(key).await?;
        match self.inner.client.get::<S::Value>(key).await {
            Ok(value) => Ok(value),
            // A lazy reload validates without storing.
            Err(e) if e.is_cache_miss() => reloader
                .source()
                .await
                .load_one(key)
                .await?
                .ok_or_else(|| crate::Error::NotFound(key.to_string())),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------ reload

    pub async fn reload(&self, key: &str) -> Result<()> {
        self.inner.reloader.reload(key).await
    }

    pub async fn reload_batch(&self, keys: &[String]) -> Result<ReloadResult> {
        self.inner.reloader.reload_batch(keys).await
    }

    /// See [`CacheReloader::reload_all`] for the `Replace` caveat.
    pub async fn reload_all(&self) -> Result<ReloadResult> {
        self.inner.reloader.reload_all().await
    }

    pub async fn reload_config(&self) -> ReloadConfig {
        self.inner.reloader.config().await
    }

    pub async fn set_reload_config(&self, config: ReloadConfig) -> Result<()> {
        config.validate()?;
        self.inner.reloader.set_config(config).await;
        Ok(())
    }

    pub async fn reload_metrics(&self) -> ReloadMetrics {
        self.inner.reloader.metrics().await
    }

    pub async fn start_scheduled_reload(&self) -> Result<()> {
        self.inner.reloader.start_scheduler().await
    }

    pub async fn stop_scheduled_reload(&self) {
        self.inner.reloader.stop().await
    }

    pub fn reloader(&self) -> &CacheReloader<B, S> {
        &self.inner.reloader
    }

    // ------------------------------------------------------ invalidation

    /// Delete `key` and its registered dependents.
    pub async fn invalidate(&self, key: &str) -> Result<u64> {
        self.inner.invalidator.invalidate(key).await
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        self.inner.invalidator.invalidate_pattern(pattern).await
    }

    pub async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64> {
        self.inner.invalidator.invalidate_by_tags(tags).await
    }

    /// Flush the whole cache database. The warm-up marker goes with it.
    pub async fn invalidate_all(&self) -> Result<()> {
        self.inner.invalidator.invalidate_all().await?;
        self.inner.warmer.reset().await
    }

    pub async fn invalidate_and_reload(&self, key: &str) -> Result<()> {
        self.inner
            .invalidator
            .invalidate_and_reload(key, &self.inner.reloader)
            .await
    }

    /// Invalidating `key` will also invalidate `dependents`.
    pub async fn register_dependency(&self, key: &str, dependents: &[String]) -> Result<()> {
        self.inner.invalidator.add_dependency(key, dependents).await
    }

    /// Set a value and add it to each tag set.
    pub async fn set_with_tags<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<()> {
        self.inner.client.set(key, value, ttl).await?;
        self.inner.invalidator.add_tags(key, tags).await
    }

    pub async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        self.inner.invalidator.tag_members(tag).await
    }

    /// Newest first.
    pub async fn recent_invalidation_events(&self, limit: usize) -> Result<Vec<InvalidationEvent>> {
        self.inner.invalidator.recent_events(limit).await
    }

    pub fn invalidator(&self) -> &CacheInvalidator<B> {
        &self.inner.invalidator
    }

    // ----------------------------------------------------------- warming

    pub async fn warm_up(&self) -> Result<WarmUpResult> {
        self.inner.warmer.warm_up().await
    }

    pub async fn warm_up_keys(&self, keys: &[String]) -> Result<WarmUpResult> {
        self.inner.warmer.warm_up_keys(keys).await
    }

    pub async fn warm_up_selective<F>(&self, filter: F) -> Result<WarmUpResult>
    where
        F: Fn(&str) -> bool,
    {
        self.inner.warmer.warm_up_selective(filter).await
    }

    pub async fn is_warmed_up(&self) -> Result<bool> {
        self.inner.warmer.is_warmed_up().await
    }

    // --------------------------------------------- hooks and transformers

    pub fn add_hook(&self, hook: Arc<dyn ReloadHook<S::Value>>) {
        self.inner.hooks.add(hook);
    }

    pub fn remove_hook(&self, name: &str) -> bool {
        self.inner.hooks.remove(name)
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.inner.hooks.names()
    }

    /// Applies to writes from now on. Entries written earlier keep the
    /// transformer names recorded in their envelope.
    pub fn add_transformer(&self, transformer: Arc<dyn DataTransformer>) {
        self.inner.transformers.add(transformer);
    }

    /// Entries still carrying this transformer in their envelope fail to
    /// decode afterwards.
    pub fn remove_transformer(&self, name: &str) -> bool {
        self.inner.transformers.remove(name)
    }

    pub fn transformer_names(&self) -> Vec<String> {
        self.inner.transformers.names()
    }

    // --------------------------------------------------------- lifecycle

    /// Stop the reload scheduler and flush queued write-behind writes.
    pub async fn close(&self) {
        self.inner.reloader.stop().await;
        let flushed = self.inner.strategy.read().await.shutdown(true).await;
        info!("✓ Cache service closed ({} queued writes flushed)", flushed);
    }
}

#[cfg(feature = "redis")]
impl<S: WritableDataSource> CacheService<RedisBackend, S> {
    /// Connect to Redis and build a service over it.
    ///
    /// # Errors
    ///
    /// `Error::BackendError` if the pool cannot be created or the server
    /// does not answer PING.
    pub async fn connect(
        redis_config: RedisConfig,
        config: EngineConfig,
        source: Arc<S>,
    ) -> Result<Self> {
        let backend = RedisBackend::new(redis_config)?;
        CacheServiceBuilder::new(backend, source)
            .with_config(config)
            .with_connect_retries(3)
            .build()
            .await
    }
}
