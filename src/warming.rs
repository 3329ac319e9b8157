//! Bulk pre-population of the cache before first read traffic.
//!
//! [`CacheWarmer::warm_up`] is idempotent: once the in-memory flag or the
//! `cache:warmed_up` marker (24h TTL) is set it returns without touching
//! the data source. The marker survives a restart within that window.
//! Warm-up always stores what it loads, even under
//! [`ReloadStrategy::Lazy`](crate::reload::ReloadStrategy::Lazy).

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::key::{WARMED_UP_KEY, WARMED_UP_TTL};
use crate::reload::{CacheReloader, ReloadResult};
use crate::repository::DataSource;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a warm-up.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WarmUpResult {
    /// False when an earlier warm-up made this call a no-op.
    pub performed: bool,
    pub keys_loaded: usize,
    pub keys_failed: usize,
    pub errors: Vec<(String, crate::Error)>,
    pub duration: Duration,
}

impl WarmUpResult {
    fn skipped() -> Self {
        WarmUpResult::default()
    }

    fn from_reload(result: ReloadResult, duration: Duration) -> Self {
        WarmUpResult {
            performed: true,
            keys_loaded: result.keys_reloaded,
            keys_failed: result.keys_failed,
            errors: result.errors,
            duration,
        }
    }
}

/// Warms the cache through a [`CacheReloader`].
pub struct CacheWarmer<B: CacheBackend, S: DataSource> {
    reloader: CacheReloader<B, S>,
    warmed_up: Arc<AtomicBool>,
}

impl<B: CacheBackend, S: DataSource> Clone for CacheWarmer<B, S> {
    fn clone(&self) -> Self {
        CacheWarmer {
            reloader: self.reloader.clone(),
            warmed_up: Arc::clone(&self.warmed_up),
        }
    }
}

impl<B: CacheBackend, S: DataSource> CacheWarmer<B, S> {
    pub fn new(reloader: CacheReloader<B, S>) -> Self {
        CacheWarmer {
            reloader,
            warmed_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load the configured warm-up keys (or every key the source lists)
    /// unless the cache is already warm. Sets the warm marker afterwards,
    /// even when some keys failed.
    pub async fn warm_up(&self) -> Result<WarmUpResult> {
        if self.is_warmed_up().await? {
            debug!("Cache already warm, skipping warm-up");
            return Ok(WarmUpResult::skipped());
        }

        let start = Instant::now();
        let keys = self.warm_up_universe().await?;
        let result = self.load(&keys).await?;
        self.mark_warmed_up().await?;

        let result = WarmUpResult::from_reload(result, start.elapsed());
        info!(
            "✓ Warm-up complete: {} keys loaded, {} failed in {:?}",
            result.keys_loaded, result.keys_failed, result.duration
        );
        Ok(result)
    }

    /// Warm exactly `keys`. Always loads and never sets the warm marker.
    pub async fn warm_up_keys(&self, keys: &[String]) -> Result<WarmUpResult> {
        let start = Instant::now();
        let result = self.load(keys).await?;
        Ok(WarmUpResult::from_reload(result, start.elapsed()))
    }

    /// Warm the keys of the usual warm-up universe that pass `filter`.
    /// Does not consult or set the warm marker.
    pub async fn warm_up_selective<F>(&self, filter: F) -> Result<WarmUpResult>
    where
        F: Fn(&str) -> bool,
    {
        let start = Instant::now();
        let keys: Vec<String> = self
            .warm_up_universe()
            .await?
            .into_iter()
            .filter(|k| filter(k))
            .collect();
        debug!("Selective warm-up over {} keys", keys.len());
        let result = self.load(&keys).await?;
        Ok(WarmUpResult::from_reload(result, start.elapsed()))
    }

    /// True if this process warmed the cache or the persisted marker is set.
    pub async fn is_warmed_up(&self) -> Result<bool> {
        if self.warmed_up.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let persisted = self.reloader.client().exists(WARMED_UP_KEY).await?;
        if persisted {
            self.warmed_up.store(true, Ordering::SeqCst);
        }
        Ok(persisted)
    }

    /// Forget warm status here and in the cache.
    pub async fn reset(&self) -> Result<()> {
        self.warmed_up.store(false, Ordering::SeqCst);
        self.reloader.client().delete(WARMED_UP_KEY).await?;
        Ok(())
    }

    async fn mark_warmed_up(&self) -> Result<()> {
        self.warmed_up.store(true, Ordering::SeqCst);
        self.reloader
            .client()
            .set(WARMED_UP_KEY, &true, Some(WARMED_UP_TTL))
            .await
    }

    async fn warm_up_universe(&self) -> Result<Vec<String>> {
        let config = self.reloader.config().await;
        if !config.warm_up_keys.is_empty() {
            return Ok(config.warm_up_keys);
        }
        self.reloader.source().await.list_keys().await
    }

    /// Load `keys` in batch-size chunks, several chunks at a time.
    async fn load(&self, keys: &[String]) -> Result<ReloadResult> {
        let config = self.reloader.config().await;
        let chunks: Vec<&[String]> = keys.chunks(config.batch_size.max(1)).collect();

        let parts: Vec<Result<ReloadResult>> = stream::iter(chunks)
            .map(|chunk| self.reloader.populate_batch(chunk))
            .buffer_unordered(config.warm_up_concurrency.max(1))
            .collect()
            .await;

        let mut total = ReloadResult::default();
        for part in parts {
            total.merge(part?);
        }
        Ok(total)
    }
}
