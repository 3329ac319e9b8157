//! Proactive reload of cache entries from a data source.
//!
//! A [`CacheReloader`] loads keys from its [`DataSource`], validates them
//! and stores them with the configured TTL. How the store happens depends
//! on [`ReloadStrategy`]:
//!
//! | Strategy | Stores? | Notes |
//! |----------|---------|-------|
//! | `Refresh` | yes | overwrite entries in place |
//! | `Replace` | yes | `reload_all` flushes the cache database first |
//! | `Lazy` | no | validate only; the next read-through miss populates |
//! | `Scheduled` | yes | like `Refresh`, also driven by the interval loop |
//!
//! The scheduled loop starts when the reloader is built with
//! `enable_scheduled_reload` and runs `reload_all` every
//! `reload_interval` until [`CacheReloader::stop`].
//!
//! Config and metrics sit behind one lock each; source and cache I/O never
//! happens while either is held.

use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::{Error, Result};
use crate::hooks::HookManager;
use crate::observability::ReloadMetrics;
use crate::repository::DataSource;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How reloaded data reaches the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReloadStrategy {
    #[default]
    Refresh,
    /// `reload_all` clears the cache database before repopulating.
    Replace,
    /// Validate only, never store.
    Lazy,
    Scheduled,
}

impl fmt::Display for ReloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadStrategy::Refresh => write!(f, "refresh"),
            ReloadStrategy::Replace => write!(f, "replace"),
            ReloadStrategy::Lazy => write!(f, "lazy"),
            ReloadStrategy::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for ReloadStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "refresh" => Ok(ReloadStrategy::Refresh),
            "replace" => Ok(ReloadStrategy::Replace),
            "lazy" => Ok(ReloadStrategy::Lazy),
            "scheduled" => Ok(ReloadStrategy::Scheduled),
            _ => Err(Error::ConfigError(format!("unknown reload strategy: {}", s))),
        }
    }
}

/// Reload and warm-up settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ReloadConfig {
    pub strategy: ReloadStrategy,
    /// TTL for stored entries; `None` stores without expiration.
    pub ttl: Option<Duration>,
    pub batch_size: usize,
    /// Extra attempts after a failed source load.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Reads that miss go back to the source through the reloader.
    pub enable_lazy_loading: bool,
    pub enable_scheduled_reload: bool,
    pub reload_interval: Duration,
    pub enable_warm_up: bool,
    /// Explicit warm-up keys. Empty means every key the source lists.
    pub warm_up_keys: Vec<String>,
    /// Batch chunks loaded at once during warm-up.
    pub warm_up_concurrency: usize,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        ReloadConfig {
            strategy: ReloadStrategy::Refresh,
            ttl: Some(Duration::from_secs(60 * 60)),
            batch_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            enable_lazy_loading: true,
            enable_scheduled_reload: false,
            reload_interval: Duration::from_secs(5 * 60),
            enable_warm_up: false,
            warm_up_keys: Vec::new(),
            warm_up_concurrency: 4,
        }
    }
}

impl ReloadConfig {
    pub fn with_strategy(mut self, strategy: ReloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_lazy_loading(mut self, enabled: bool) -> Self {
        self.enable_lazy_loading = enabled;
        self
    }

    pub fn with_scheduled_reload(mut self, interval: Duration) -> Self {
        self.enable_scheduled_reload = true;
        self.reload_interval = interval;
        self
    }

    pub fn with_warm_up(mut self, keys: Vec<String>) -> Self {
        self.enable_warm_up = true;
        self.warm_up_keys = keys;
        self
    }

    pub fn with_warm_up_concurrency(mut self, concurrency: usize) -> Self {
        self.warm_up_concurrency = concurrency.max(1);
        self
    }

    /// Reject settings the reloader cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::ConfigError("batch_size must be at least 1".into()));
        }
        if self.enable_scheduled_reload && self.reload_interval.is_zero() {
            return Err(Error::ConfigError(
                "reload_interval must be non-zero when scheduled reload is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a batch reload or warm-up. Per-key failures are collected,
/// not raised.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReloadResult {
    pub keys_reloaded: usize,
    pub keys_failed: usize,
    pub errors: Vec<(String, Error)>,
    pub duration: Duration,
}

impl ReloadResult {
    pub fn is_success(&self) -> bool {
        self.keys_failed == 0
    }

    pub(crate) fn fail(&mut self, key: &str, error: Error) {
        debug!("✗ Reload failed for {}: {}", key, error);
        self.keys_failed += 1;
        self.errors.push((key.to_string(), error));
    }

    pub(crate) fn merge(&mut self, other: ReloadResult) {
        self.keys_reloaded += other.keys_reloaded;
        self.keys_failed += other.keys_failed;
        self.errors.extend(other.errors);
    }
}

struct Scheduler {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Reloads cache entries from a [`DataSource`].
///
/// Clones share configuration, metrics, hooks and the scheduler.
pub struct CacheReloader<B: CacheBackend, S: DataSource> {
    client: CacheClient<B>,
    source: Arc<RwLock<Arc<S>>>,
    config: Arc<RwLock<ReloadConfig>>,
    metrics: Arc<RwLock<ReloadMetrics>>,
    hooks: Arc<HookManager<S::Value>>,
    scheduler: Arc<Mutex<Option<Scheduler>>>,
}

impl<B: CacheBackend, S: DataSource> Clone for CacheReloader<B, S> {
    fn clone(&self) -> Self {
        CacheReloader {
            client: self.client.clone(),
            source: Arc::clone(&self.source),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            hooks: Arc::clone(&self.hooks),
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<B: CacheBackend, S: DataSource> CacheReloader<B, S> {
    /// Build a reloader. With `enable_scheduled_reload` the interval loop
    /// is spawned right away, so this must run inside a Tokio runtime.
    pub fn new(client: CacheClient<B>, source: Arc<S>, config: ReloadConfig) -> Self {
        Self::with_hooks(client, source, config, Arc::new(HookManager::new()))
    }

    pub fn with_hooks(
        client: CacheClient<B>,
        source: Arc<S>,
        config: ReloadConfig,
        hooks: Arc<HookManager<S::Value>>,
    ) -> Self {
        let scheduled = config.enable_scheduled_reload;
        let interval = config.reload_interval;
        let reloader = CacheReloader {
            client,
            source: Arc::new(RwLock::new(source)),
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(ReloadMetrics::default())),
            hooks,
            scheduler: Arc::new(Mutex::new(None)),
        };
        if scheduled && !interval.is_zero() {
            if let Ok(mut slot) = reloader.scheduler.try_lock() {
                *slot = Some(reloader.spawn_scheduler(interval));
            }
        }
        reloader
    }

    pub fn client(&self) -> &CacheClient<B> {
        &self.client
    }

    pub fn hooks(&self) -> &Arc<HookManager<S::Value>> {
        &self.hooks
    }

    pub async fn config(&self) -> ReloadConfig {
        self.config.read().await.clone()
    }

    /// Replace the config. A running scheduler keeps its interval until it
    /// is restarted.
    pub async fn set_config(&self, config: ReloadConfig) {
        *self.config.write().await = config;
    }

    pub async fn source(&self) -> Arc<S> {
        Arc::clone(&*self.source.read().await)
    }

    pub async fn set_source(&self, source: Arc<S>) {
        *self.source.write().await = source;
    }

    pub async fn metrics(&self) -> ReloadMetrics {
        self.metrics.read().await.clone()
    }

    /// Feed a cache read outcome into the hit rate.
    pub async fn record_cache_access(&self, hit: bool) {
        self.metrics.write().await.record_cache_access(hit);
    }

    async fn record(&self, success: bool, elapsed: Duration) {
        self.metrics.write().await.record_reload(success, elapsed);
    }

    // ------------------------------------------------------------- reloads

    /// Reload one key.
    ///
    /// Runs `before_reload` hooks, loads with retries, validates, stores
    /// (unless `Lazy`), then runs `after_reload` hooks. Any failure runs the
    /// `on_reload_error` hooks and is returned.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`: the source has no value for `key`
    /// - `Error::SourceError`: the load failed on every attempt
    /// - `Error::ValidationError`: the loaded value was rejected
    /// - `Error::HookError`: a hook aborted the reload
    pub async fn reload(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.reload_one(key).await;
        self.record(result.is_ok(), start.elapsed()).await;

        match &result {
            Ok(()) => debug!("✓ Reloaded {} in {:?}", key, start.elapsed()),
            Err(e) => {
                debug!("✗ Reload of {} failed: {}", key, e);
                if let Err(hook_err) = self.hooks.on_reload_error(key, e) {
                    warn!("⚠ Error hook failed for {}: {}", key, hook_err);
                }
            }
        }
        result
    }

    async fn reload_one(&self, key: &str) -> Result<()> {
        let config = self.config().await;
        let source = self.source().await;

        self.hooks.before_reload(key)?;
        let value = retry(&config, key, || source.load_one(key))
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        source.validate(&value)?;

        if config.strategy == ReloadStrategy::Lazy {
            debug!("Lazy reload validated {} without storing", key);
        } else {
            self.client.set(key, &value, config.ttl).await?;
        }
        self.hooks.after_reload(key, &value)
    }

    /// Reload many keys in chunks of `batch_size`.
    ///
    /// Keys that are missing, fail to load or fail validation are counted
    /// in the result; only a failed cache pipeline fails the whole call.
    pub async fn reload_batch(&self, keys: &[String]) -> Result<ReloadResult> {
        let start = Instant::now();
        let config = self.config().await;

        let mut outcome = Ok(ReloadResult::default());
        for chunk in keys.chunks(config.batch_size.max(1)) {
            match self.load_and_store_batch(chunk).await {
                Ok(part) => {
                    if let Ok(total) = outcome.as_mut() {
                        total.merge(part);
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let elapsed = start.elapsed();
        let success = matches!(&outcome, Ok(r) if r.is_success());
        self.record(success, elapsed).await;

        let mut result = outcome?;
        result.duration = elapsed;
        info!(
            "✓ Batch reload: {} reloaded, {} failed in {:?}",
            result.keys_reloaded, result.keys_failed, elapsed
        );
        Ok(result)
    }

    /// Reload everything the source holds.
    ///
    /// With [`ReloadStrategy::Replace`] the cache database is flushed first.
    /// That is destructive and not atomic: readers can see an empty cache
    /// until the repopulation finishes, and markers (tags, dependencies,
    /// warm-up) are wiped too.
    pub async fn reload_all(&self) -> Result<ReloadResult> {
        let start = Instant::now();
        let outcome = self.reload_everything().await;
        let elapsed = start.elapsed();
        let success = matches!(&outcome, Ok(r) if r.is_success());
        self.record(success, elapsed).await;

        let mut result = outcome?;
        result.duration = elapsed;
        info!(
            "✓ Full reload: {} reloaded, {} failed in {:?}",
            result.keys_reloaded, result.keys_failed, elapsed
        );
        Ok(result)
    }

    async fn reload_everything(&self) -> Result<ReloadResult> {
        let config = self.config().await;
        let source = self.source().await;

        if config.strategy == ReloadStrategy::Replace {
            warn!("⚠ Replace reload: flushing the cache database before repopulating");
            self.client.flush_db().await?;
        }

        let mut loaded = retry(&config, "*", || source.load_all()).await?;
        let mut keys: Vec<String> = loaded.keys().cloned().collect();
        keys.sort();

        let mut result = ReloadResult::default();
        for chunk in keys.chunks(config.batch_size.max(1)) {
            let part: HashMap<String, S::Value> = chunk
                .iter()
                .filter_map(|k| loaded.remove(k).map(|v| (k.clone(), v)))
                .collect();
            let validate_only = config.strategy == ReloadStrategy::Lazy;
            let stored = self
                .store_loaded(source.as_ref(), &config, chunk, part, validate_only)
                .await?;
            result.merge(stored);
        }
        Ok(result)
    }

    /// Load one chunk from the source and store what passes validation in
    /// one pipeline. Under [`ReloadStrategy::Lazy`] nothing is stored.
    /// Does not touch metrics.
    pub(crate) async fn load_and_store_batch(&self, keys: &[String]) -> Result<ReloadResult> {
        let validate_only = self.config().await.strategy == ReloadStrategy::Lazy;
        self.load_chunk(keys, validate_only).await
    }

    /// Like [`load_and_store_batch`](Self::load_and_store_batch), but always
    /// stores. Warm-up populates the cache whatever the reload strategy.
    pub(crate) async fn populate_batch(&self, keys: &[String]) -> Result<ReloadResult> {
        self.load_chunk(keys, false).await
    }

    async fn load_chunk(&self, keys: &[String], validate_only: bool) -> Result<ReloadResult> {
        let config = self.config().await;
        let source = self.source().await;

        match retry(&config, "batch", || source.load_batch(keys)).await {
            Ok(loaded) => {
                self.store_loaded(source.as_ref(), &config, keys, loaded, validate_only)
                    .await
            }
            Err(e) => {
                let mut result = ReloadResult::default();
                for key in keys {
                    result.fail(key, e.clone());
                }
                Ok(result)
            }
        }
    }

    async fn store_loaded(
        &self,
        source: &S,
        config: &ReloadConfig,
        keys: &[String],
        mut loaded: HashMap<String, S::Value>,
        validate_only: bool,
    ) -> Result<ReloadResult> {
        let mut result = ReloadResult::default();
        let mut batch = self.client.pipeline();

        for key in keys {
            let Some(value) = loaded.remove(key) else {
                result.fail(key, Error::NotFound(key.clone()));
                continue;
            };
            if let Err(e) = source.validate(&value) {
                result.fail(key, e);
                continue;
            }
            if validate_only {
                result.keys_reloaded += 1;
                continue;
            }
            match batch.set(key, &value, config.ttl) {
                Ok(_) => result.keys_reloaded += 1,
                Err(e) => result.fail(key, e),
            }
        }

        batch.execute().await?;
        Ok(result)
    }

    // ----------------------------------------------------------- scheduler

    /// Start the interval loop if it is not running.
    pub async fn start_scheduler(&self) -> Result<()> {
        let interval = self.config.read().await.reload_interval;
        if interval.is_zero() {
            return Err(Error::ConfigError("reload_interval must be non-zero".into()));
        }
        let mut slot = self.scheduler.lock().await;
        if slot.is_none() {
            *slot = Some(self.spawn_scheduler(interval));
        }
        Ok(())
    }

    pub async fn is_scheduler_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    /// Stop the interval loop and wait for it to exit. A reload already in
    /// progress finishes; no new one starts.
    pub async fn stop(&self) {
        let scheduler = self.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            let _ = scheduler.stop.send(true);
            if let Err(e) = scheduler.handle.await {
                error!("✗ Scheduled reload task failed: {}", e);
            }
            info!("✓ Scheduled reload stopped");
        }
    }

    fn spawn_scheduler(&self, period: Duration) -> Scheduler {
        let (stop, mut stop_rx) = watch::channel(false);
        let reloader = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("✓ Scheduled reload started (every {:?})", period);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        match reloader.reload_all().await {
                            Ok(r) => debug!(
                                "Scheduled reload: {} reloaded, {} failed",
                                r.keys_reloaded, r.keys_failed
                            ),
                            Err(e) => warn!("⚠ Scheduled reload failed: {}", e),
                        }
                    }
                }
            }
        });

        Scheduler { stop, handle }
    }
}

/// Run a source load, retrying up to `max_retries` more times with
/// `retry_delay` between attempts.
async fn retry<T, F, Fut>(config: &ReloadConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                debug!(
                    "Source load for {} failed (attempt {}/{}): {}, retrying...",
                    what, attempt, max_attempts, e
                );
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}
