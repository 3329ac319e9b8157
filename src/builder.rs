//! Fluent construction of a [`CacheService`].

use crate::backend::CacheBackend;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hooks::{DataTransformer, ReloadHook};
use crate::invalidation::InvalidationConfig;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::reload::ReloadConfig;
use crate::repository::WritableDataSource;
use crate::serialization::Codec;
use crate::service::CacheService;
use crate::strategy::StrategyKind;
use std::sync::Arc;
use std::time::Duration;

/// Fluent builder for a [`CacheService`].
///
/// Starts from [`EngineConfig::default`]; each `with_*` call overrides one
/// part of it. Hooks and transformers registered here are in place before
/// the startup warm-up runs.
///
/// # Example
///
/// ```
/// use cache_engine::backend::InMemoryBackend;
/// use cache_engine::repository::InMemorySource;
/// use cache_engine::strategy::StrategyKind;
/// use cache_engine::CacheServiceBuilder;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> cache_engine::Result<()> {
/// let source = Arc::new(InMemorySource::<String>::new());
/// let service = CacheServiceBuilder::new(InMemoryBackend::new(), source)
///     .with_strategy(StrategyKind::WriteBehind)
///     .with_ttl(Duration::from_secs(300))
///     .with_connect_retries(3)
///     .build()
///     .await?;
/// # service.close().await;
/// # Ok(())
/// # }
/// ```
pub struct CacheServiceBuilder<B: CacheBackend, S: WritableDataSource> {
    backend: B,
    source: Arc<S>,
    config: EngineConfig,
    metrics: Arc<dyn CacheMetrics>,
    hooks: Vec<Arc<dyn ReloadHook<S::Value>>>,
    transformers: Vec<Arc<dyn DataTransformer>>,
    connect_retries: u32,
}

impl<B: CacheBackend, S: WritableDataSource> CacheServiceBuilder<B, S> {
    pub fn new(backend: B, source: Arc<S>) -> Self {
        Self {
            backend,
            source,
            config: EngineConfig::default(),
            metrics: Arc::new(NoOpMetrics),
            hooks: Vec::new(),
            transformers: Vec::new(),
            connect_retries: 0,
        }
    }

    /// Replace the whole configuration. Later `with_*` calls still apply.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// TTL for strategy writes and read-through population.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = Some(ttl);
        self
    }

    /// Strategy writes never expire unless given a TTL.
    pub fn without_ttl(mut self) -> Self {
        self.config.default_ttl = None;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn with_write_behind_capacity(mut self, capacity: usize) -> Self {
        self.config.write_behind_capacity = capacity;
        self
    }

    pub fn with_reload_config(mut self, reload: ReloadConfig) -> Self {
        self.config.reload = reload;
        self
    }

    pub fn with_invalidation_config(mut self, invalidation: InvalidationConfig) -> Self {
        self.config.invalidation = invalidation;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ReloadHook<S::Value>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn DataTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Retry the startup health check up to `count` times.
    pub fn with_connect_retries(mut self, count: u32) -> Self {
        self.connect_retries = count;
        self
    }

    /// Check the backend answers, then assemble the service.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigError`: the configuration does not validate
    /// - `Error::BackendError`: the backend failed its health check on
    ///   every attempt
    ///
    /// Failed health checks are retried up to `connect_retries` times with
    /// exponential backoff starting at 100ms and capped at 30s.
    pub async fn build(self) -> Result<CacheService<B, S>> {
        self.config.validate()?;
        self.wait_for_backend().await?;
        CacheService::assemble(
            self.backend,
            self.source,
            self.config,
            self.metrics,
            self.hooks,
            self.transformers,
        )
        .await
    }

    async fn wait_for_backend(&self) -> Result<()> {
        let mut attempts = 0;
        let max_attempts = self.connect_retries + 1;

        loop {
            attempts += 1;

            let error = match self.backend.health_check().await {
                Ok(true) => {
                    debug!("✓ Backend healthy after {} attempt(s)", attempts);
                    return Ok(());
                }
                Ok(false) => Error::BackendError("health check failed".into()),
                Err(e) => e,
            };

            if attempts >= max_attempts {
                error!("✗ Backend unavailable after {} attempt(s): {}", attempts, error);
                return Err(error);
            }

            debug!(
                "Backend health check failed (attempt {}/{}), retrying...",
                attempts, max_attempts
            );
            tokio::time::sleep(backoff_delay(attempts)).await;
        }
    }
}

/// Delay before retry `attempt` (1-based): 100ms doubling, capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    const MAX_DELAY_MS: u64 = 30_000;
    let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(100_u64.saturating_mul(factor).min(MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::hooks::ReloadHook;
    use crate::repository::InMemorySource;
    use crate::transformers::CompressionTransformer;

    struct Audit;

    impl ReloadHook<u32> for Audit {
        fn name(&self) -> &str {
            "audit"
        }
    }

    #[tokio::test]
    async fn test_builder_applies_overrides() {
        let source = Arc::new(InMemorySource::<u32>::new());
        let service = CacheServiceBuilder::new(InMemoryBackend::new(), source)
            .with_strategy(StrategyKind::CacheAside)
            .with_codec(Codec::Postcard)
            .without_ttl()
            .with_hook(Arc::new(Audit))
            .with_transformer(Arc::new(CompressionTransformer::new()))
            .build()
            .await
            .expect("build");

        assert_eq!(service.strategy_kind().await, StrategyKind::CacheAside);
        assert_eq!(service.config().codec, Codec::Postcard);
        assert_eq!(service.config().default_ttl, None);
        assert_eq!(service.hook_names(), vec!["audit"]);
        assert_eq!(service.transformer_names(), vec!["compression"]);
    }

    #[tokio::test]
    async fn test_builder_rejects_zero_capacity() {
        let source = Arc::new(InMemorySource::<u32>::new());
        let result = CacheServiceBuilder::new(InMemoryBackend::new(), source)
            .with_write_behind_capacity(0)
            .build()
            .await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(4), Duration::from_millis(800));
        assert_eq!(backoff_delay(64), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(30));
    }
}
