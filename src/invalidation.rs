//! Key, pattern, tag and dependency based invalidation.
//!
//! Dependencies (`key -> dependents`) live in process memory and are
//! mirrored to `cache:dependency:<key>` sets with a 24h expiry. The
//! in-memory map is authoritative; the remote copy is consulted on a local
//! miss, so dependency knowledge survives a restart within the TTL window.
//! Invalidating a key removes its direct dependents only (one level).
//!
//! Tag sets (`cache:tag:<tag>`) have no TTL. Tag invalidation strips the
//! removed keys from every tag set so stale memberships cannot resurrect
//! them.
//!
//! Every invalidation appends an [`InvalidationEvent`] to
//! `cache:invalidation_events`, capped and expiring after 7 days. Event
//! recording is best effort.
//!
//! Two processes sharing one cache can race on these markers; nothing here
//! coordinates across processes.

use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::{Error, Result};
use crate::key::{MarkerKey, DEPENDENCY_TTL, EVENTS_TTL, INVALIDATION_EVENTS_KEY};
use crate::reload::CacheReloader;
use crate::repository::DataSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Invalidation settings.
#[derive(Clone, Debug, PartialEq)]
pub struct InvalidationConfig {
    /// Keys per delete command.
    pub batch_size: usize,
    /// Attempts per delete chunk before giving up.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `retry_delay * n`.
    pub retry_delay: Duration,
    /// Events kept in the event log.
    pub max_events: usize,
    pub record_events: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        InvalidationConfig {
            batch_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_events: 1000,
            record_events: true,
        }
    }
}

impl InvalidationConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_event_log(mut self, enabled: bool) -> Self {
        self.record_events = enabled;
        self
    }
}

/// One entry of the invalidation event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Key, pattern, tag list or `*`.
    pub target: String,
    /// `key`, `pattern`, `tags` or `all`.
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub keys_invalidated: u64,
    pub duration_ms: u64,
}

/// Invalidates cache entries and tracks dependencies and tags.
pub struct CacheInvalidator<B: CacheBackend> {
    client: CacheClient<B>,
    config: InvalidationConfig,
    dependencies: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl<B: CacheBackend> Clone for CacheInvalidator<B> {
    fn clone(&self) -> Self {
        CacheInvalidator {
            client: self.client.clone(),
            config: self.config.clone(),
            dependencies: Arc::clone(&self.dependencies),
        }
    }
}

impl<B: CacheBackend> CacheInvalidator<B> {
    pub fn new(client: CacheClient<B>, config: InvalidationConfig) -> Self {
        CacheInvalidator {
            client,
            config,
            dependencies: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &InvalidationConfig {
        &self.config
    }

    // -------------------------------------------------------- dependencies

    /// Register `dependents` as invalidated along with `key`.
    pub async fn add_dependency(&self, key: &str, dependents: &[String]) -> Result<()> {
        if dependents.is_empty() {
            return Ok(());
        }
        {
            let mut map = self.dependencies.write().await;
            map.entry(key.to_string())
                .or_default()
                .extend(dependents.iter().cloned());
        }

        let marker = MarkerKey::dependency(key);
        self.client.sadd(&marker, dependents).await?;
        self.client.expire(&marker, DEPENDENCY_TTL).await?;
        debug!("✓ Registered {} dependents for {}", dependents.len(), key);
        Ok(())
    }

    pub async fn remove_dependency(&self, key: &str) -> Result<()> {
        self.dependencies.write().await.remove(key);
        self.client.delete(&MarkerKey::dependency(key)).await?;
        Ok(())
    }

    /// Direct dependents of `key`, sorted. Falls back to the mirrored set
    /// when the process has no local record.
    pub async fn dependents(&self, key: &str) -> Result<Vec<String>> {
        let local = self.dependencies.read().await.get(key).cloned();
        let set = match local {
            Some(set) => set,
            None => {
                let remote = self.client.smembers(&MarkerKey::dependency(key)).await?;
                if remote.is_empty() {
                    return Ok(Vec::new());
                }
                let set: HashSet<String> = remote.into_iter().collect();
                self.dependencies
                    .write()
                    .await
                    .entry(key.to_string())
                    .or_default()
                    .extend(set.iter().cloned());
                set
            }
        };
        let mut out: Vec<String> = set.into_iter().collect();
        out.sort();
        Ok(out)
    }

    // ----------------------------------------------------------------- tags

    /// Add `key` to every tag set in `tags`.
    pub async fn add_tags(&self, key: &str, tags: &[String]) -> Result<()> {
        let member = [key.to_string()];
        for tag in tags {
            self.client.sadd(&MarkerKey::tag(tag), &member).await?;
        }
        Ok(())
    }

    pub async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        let mut members = self.client.smembers(&MarkerKey::tag(tag)).await?;
        members.sort();
        Ok(members)
    }

    // --------------------------------------------------------- invalidation

    /// Delete `key` and its direct dependents. Returns how many existed.
    pub async fn invalidate(&self, key: &str) -> Result<u64> {
        let start = Instant::now();
        let mut targets = BTreeSet::from([key.to_string()]);
        targets.extend(self.dependents(key).await?);

        let removed = self.delete_keys(targets.into_iter().collect()).await?;
        self.record_event(key, "key", removed, start).await;
        Ok(removed)
    }

    /// Delete every key matching `pattern` (found by cursor scan) and their
    /// dependents.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let start = Instant::now();
        let matched = self.client.scan_keys(pattern).await?;
        let targets = self.with_dependents(matched).await?;

        let removed = self.delete_keys(targets).await?;
        self.record_event(pattern, "pattern", removed, start).await;
        info!("✓ Invalidated {} keys matching {}", removed, pattern);
        Ok(removed)
    }

    /// Delete every member of the given tags, then strip those keys from
    /// every tag set.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64> {
        let start = Instant::now();
        let tag_keys: Vec<String> = tags.iter().map(|t| MarkerKey::tag(t)).collect();
        let members = self.client.sunion(&tag_keys).await?;
        if members.is_empty() {
            self.record_event(&tags.join(","), "tags", 0, start).await;
            return Ok(0);
        }

        let targets = self.with_dependents(members.clone()).await?;
        let removed = self.delete_keys(targets).await?;

        for tag_set in self.client.scan_keys(&MarkerKey::tag_pattern()).await? {
            self.client.srem(&tag_set, &members).await?;
        }

        self.record_event(&tags.join(","), "tags", removed, start).await;
        info!("✓ Invalidated {} keys for tags {:?}", removed, tags);
        Ok(removed)
    }

    /// Flush the cache database and forget every dependency.
    pub async fn invalidate_all(&self) -> Result<()> {
        let start = Instant::now();
        warn!("⚠ Invalidating the entire cache database");
        self.client.flush_db().await?;
        self.dependencies.write().await.clear();
        self.record_event("*", "all", 0, start).await;
        Ok(())
    }

    /// Invalidate `key`, then reload it. The reload only runs once the
    /// invalidation has fully succeeded.
    pub async fn invalidate_and_reload<S: DataSource>(
        &self,
        key: &str,
        reloader: &CacheReloader<B, S>,
    ) -> Result<()> {
        self.invalidate(key).await?;
        reloader.reload(key).await
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<InvalidationEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        self.client.lrange(INVALIDATION_EVENTS_KEY, 0, stop).await
    }

    async fn with_dependents(&self, keys: Vec<String>) -> Result<Vec<String>> {
        let mut targets: BTreeSet<String> = BTreeSet::new();
        for key in keys {
            targets.extend(self.dependents(&key).await?);
            targets.insert(key);
        }
        Ok(targets.into_iter().collect())
    }

    /// Delete in chunks of `batch_size`, retrying each chunk.
    async fn delete_keys(&self, keys: Vec<String>) -> Result<u64> {
        let mut removed = 0;
        for chunk in keys.chunks(self.config.batch_size.max(1)) {
            removed += retry_linear(&self.config, || self.client.delete_many(chunk)).await?;
        }
        Ok(removed)
    }

    async fn record_event(&self, target: &str, strategy: &str, removed: u64, start: Instant) {
        if !self.config.record_events {
            return;
        }
        let event = InvalidationEvent {
            target: target.to_string(),
            strategy: strategy.to_string(),
            timestamp: Utc::now(),
            keys_invalidated: removed,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if let Err(e) = self.append_event(&event).await {
            warn!("⚠ Failed to record invalidation event for {}: {}", target, e);
        }
    }

    async fn append_event(&self, event: &InvalidationEvent) -> Result<()> {
        let cap = i64::try_from(self.config.max_events.max(1)).unwrap_or(i64::MAX);
        self.client
            .lpush(INVALIDATION_EVENTS_KEY, std::slice::from_ref(event))
            .await?;
        self.client.ltrim(INVALIDATION_EVENTS_KEY, 0, cap - 1).await?;
        self.client.expire(INVALIDATION_EVENTS_KEY, EVENTS_TTL).await?;
        Ok(())
    }
}

/// Run `op` up to `max_retries` times, waiting `retry_delay * attempt`
/// after each failure.
async fn retry_linear<T, F, Fut>(config: &InvalidationConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("⚠ Batch delete failed (attempt {}/{}): {}", attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(config.retry_delay * attempt).await;
                }
            }
        }
    }
    Err(Error::RetryExhausted {
        attempts,
        message: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn invalidator() -> (CacheClient<InMemoryBackend>, CacheInvalidator<InMemoryBackend>) {
        let client = CacheClient::new(InMemoryBackend::new());
        let invalidator = CacheInvalidator::new(client.clone(), InvalidationConfig::default());
        (client, invalidator)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_invalidate_cascades_one_level() {
        let (client, inv) = invalidator();
        for key in ["user:1", "profile:1", "avatar:1"] {
            client.set(key, &1u8, None).await.expect("set");
        }
        inv.add_dependency("user:1", &strings(&["profile:1"]))
            .await
            .expect("dep");
        inv.add_dependency("profile:1", &strings(&["avatar:1"]))
            .await
            .expect("dep");

        assert_eq!(inv.invalidate("user:1").await.expect("invalidate"), 2);
        assert!(!client.exists("user:1").await.expect("exists"));
        assert!(!client.exists("profile:1").await.expect("exists"));
        assert!(client.exists("avatar:1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_dependencies_are_mirrored_with_ttl() {
        let (client, inv) = invalidator();
        inv.add_dependency("user:1", &strings(&["session:1"]))
            .await
            .expect("dep");
        let marker = MarkerKey::dependency("user:1");
        assert_eq!(client.smembers(&marker).await.expect("members"), vec!["session:1"]);
        assert!(matches!(
            client.ttl(&marker).await.expect("ttl"),
            crate::backend::KeyTtl::Expires(_)
        ));
    }

    #[tokio::test]
    async fn test_dependencies_recovered_from_cache() {
        let (client, inv) = invalidator();
        inv.add_dependency("user:1", &strings(&["session:1"]))
            .await
            .expect("dep");

        // A fresh process sharing the same cache.
        let restarted = CacheInvalidator::new(client.clone(), InvalidationConfig::default());
        client.set("user:1", &1u8, None).await.expect("set");
        client.set("session:1", &1u8, None).await.expect("set");
        assert_eq!(restarted.invalidate("user:1").await.expect("invalidate"), 2);
        assert!(!client.exists("session:1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_pattern_invalidation() {
        let (client, inv) = invalidator();
        for i in 0..120 {
            client.set(&format!("session:{}", i), &i, None).await.expect("set");
        }
        client.set("user:1", &1u8, None).await.expect("set");
        let removed = inv
            .invalidate_pattern("session:*")
            .await
            .expect("invalidate");
        assert_eq!(removed, 120);
        assert!(client.exists("user:1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_tag_invalidation_cleans_every_tag_set() {
        let (client, inv) = invalidator();
        client.set("a", &1u8, None).await.expect("set");
        client.set("b", &2u8, None).await.expect("set");
        client.set("c", &3u8, None).await.expect("set");
        inv.add_tags("a", &strings(&["red", "round"])).await.expect("tag");
        inv.add_tags("b", &strings(&["red"])).await.expect("tag");
        inv.add_tags("c", &strings(&["round"])).await.expect("tag");

        assert_eq!(inv.invalidate_by_tags(&strings(&["red"])).await.expect("tags"), 2);
        assert!(!client.exists("a").await.expect("exists"));
        assert!(!client.exists("b").await.expect("exists"));
        assert!(client.exists("c").await.expect("exists"));
        assert!(inv.tag_members("red").await.expect("members").is_empty());
        assert_eq!(inv.tag_members("round").await.expect("members"), vec!["c"]);
    }

    #[tokio::test]
    async fn test_events_are_recorded_newest_first_and_capped() {
        let client = CacheClient::new(InMemoryBackend::new());
        let inv = CacheInvalidator::new(
            client.clone(),
            InvalidationConfig::default().with_max_events(3),
        );
        for i in 0..5 {
            inv.invalidate(&format!("k{}", i)).await.expect("invalidate");
        }
        let events = inv.recent_events(10).await.expect("events");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].target, "k4");
        assert_eq!(events[0].strategy, "key");
        assert!(matches!(
            client.ttl(INVALIDATION_EVENTS_KEY).await.expect("ttl"),
            crate::backend::KeyTtl::Expires(_)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_all_forgets_dependencies() {
        let (client, inv) = invalidator();
        inv.add_dependency("user:1", &strings(&["session:1"]))
            .await
            .expect("dep");
        client.set("user:1", &1u8, None).await.expect("set");
        inv.invalidate_all().await.expect("all");
        assert!(!client.exists("user:1").await.expect("exists"));
        assert!(inv.dependents("user:1").await.expect("deps").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_linear_backoff_then_success() {
        let config = InvalidationConfig::default().with_retries(3, Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = retry_linear(&config, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::BackendError("down".into()))
            } else {
                Ok(7u64)
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after attempt 1, 200ms after attempt 2.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_is_surfaced() {
        let config = InvalidationConfig::default().with_retries(2, Duration::from_millis(10));
        let err = retry_linear(&config, || async {
            Err::<u64, _>(Error::BackendError("down".into()))
        })
        .await
        .expect_err("always fails");
        assert!(matches!(err, Error::RetryExhausted { attempts: 2, .. }));
    }
}
