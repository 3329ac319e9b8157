//! Data source abstraction.
//!
//! A [`DataSource`] is the system of record the cache sits in front of (a
//! database, an upstream API). Strategies, the reloader and the warmer load
//! through it; write strategies store through [`WritableDataSource`].
//!
//! Implementations must be safe to call concurrently: warm-up loads
//! several batch chunks at once.

use crate::error::{Error, Result};
use crate::serialization::CacheValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read side of the system of record.
///
/// # Example
///
/// ```ignore
/// struct UserTable { pool: PgPool }
///
/// impl DataSource for UserTable {
///     type Value = User;
///
///     async fn load_one(&self, key: &str) -> Result<Option<User>> {
///         sqlx::query_as("SELECT * FROM users WHERE id = $1")
///             .bind(key)
///             .fetch_optional(&self.pool)
///             .await
///             .map_err(|e| Error::SourceError(e.to_string()))
///     }
///     // ...
/// }
/// ```
pub trait DataSource: Send + Sync + 'static {
    type Value: CacheValue;

    /// Load one value. `Ok(None)` when the source has nothing for `key`.
    fn load_one(&self, key: &str)
        -> impl Future<Output = Result<Option<Self::Value>>> + Send;

    /// Load several values. Keys the source does not have are omitted.
    fn load_batch(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, Self::Value>>> + Send;

    /// Load everything the source holds.
    fn load_all(&self) -> impl Future<Output = Result<HashMap<String, Self::Value>>> + Send;

    /// Every key the source holds.
    fn list_keys(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Check a loaded value before it is cached.
    fn validate(&self, _value: &Self::Value) -> Result<()> {
        Ok(())
    }
}

/// Write side of the system of record, used by the write strategies.
pub trait WritableDataSource: DataSource {
    fn store(&self, key: &str, value: &Self::Value) -> impl Future<Output = Result<()>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Per-method call counts of an [`InMemorySource`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceCalls {
    pub load_one: usize,
    pub load_batch: usize,
    pub load_all: usize,
    pub list_keys: usize,
    pub store: usize,
    pub remove: usize,
}

#[derive(Default)]
struct Counters {
    load_one: AtomicUsize,
    load_batch: AtomicUsize,
    load_all: AtomicUsize,
    list_keys: AtomicUsize,
    store: AtomicUsize,
    remove: AtomicUsize,
}

struct SourceState<V> {
    data: BTreeMap<String, V>,
    invalid: HashSet<String>,
    failing: HashSet<String>,
    fail_writes: bool,
}

/// In-memory [`DataSource`] for tests and demos.
///
/// Clones share state. Counts calls per method so tests can assert how
/// often the source was hit, and can be told to fail loads or validation
/// for specific keys.
///
/// # Example
///
/// ```
/// use cache_engine::repository::{DataSource, InMemorySource};
///
/// # async fn example() -> cache_engine::Result<()> {
/// let source = InMemorySource::new();
/// source.insert("user:1", "Alice".to_string());
///
/// assert_eq!(source.load_one("user:1").await?, Some("Alice".to_string()));
/// assert_eq!(source.calls().load_one, 1);
/// # Ok(())
/// # }
/// ```
pub struct InMemorySource<V> {
    state: Arc<RwLock<SourceState<V>>>,
    counters: Arc<Counters>,
}

impl<V> Clone for InMemorySource<V> {
    fn clone(&self) -> Self {
        InMemorySource {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<V: CacheValue> Default for InMemorySource<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: CacheValue> InMemorySource<V> {
    pub fn new() -> Self {
        InMemorySource {
            state: Arc::new(RwLock::new(SourceState {
                data: BTreeMap::new(),
                invalid: HashSet::new(),
                failing: HashSet::new(),
                fail_writes: false,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_entries<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let source = Self::new();
        for (key, value) in entries {
            source.insert(key, value);
        }
        source
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.write().data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.read().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values loaded for `key` fail [`DataSource::validate`].
    pub fn mark_invalid(&self, key: impl Into<String>) {
        self.write().invalid.insert(key.into());
    }

    /// Loads touching `key` fail with [`Error::SourceError`].
    pub fn fail_key(&self, key: impl Into<String>) {
        self.write().failing.insert(key.into());
    }

    /// Make `store`/`remove` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.write().fail_writes = fail;
    }

    pub fn calls(&self) -> SourceCalls {
        let c = &self.counters;
        SourceCalls {
            load_one: c.load_one.load(Ordering::SeqCst),
            load_batch: c.load_batch.load(Ordering::SeqCst),
            load_all: c.load_all.load(Ordering::SeqCst),
            list_keys: c.list_keys.load(Ordering::SeqCst),
            store: c.store.load(Ordering::SeqCst),
            remove: c.remove.load(Ordering::SeqCst),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SourceState<V>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SourceState<V>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_checked(state: &SourceState<V>, key: &str) -> Result<Option<V>> {
        if state.failing.contains(key) {
            return Err(Error::SourceError(format!("load failed for {}", key)));
        }
        Ok(state.data.get(key).cloned())
    }
}

impl<V: CacheValue> DataSource for InMemorySource<V> {
    type Value = V;

    async fn load_one(&self, key: &str) -> Result<Option<V>> {
        self.counters.load_one.fetch_add(1, Ordering::SeqCst);
        let state = self.read();
        Self::load_checked(&state, key)
    }

    async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, V>> {
        self.counters.load_batch.fetch_add(1, Ordering::SeqCst);
        let state = self.read();
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = Self::load_checked(&state, key)? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    async fn load_all(&self) -> Result<HashMap<String, V>> {
        self.counters.load_all.fetch_add(1, Ordering::SeqCst);
        let state = self.read();
        if let Some(key) = state.failing.iter().next() {
            return Err(Error::SourceError(format!("load failed for {}", key)));
        }
        Ok(state
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.counters.list_keys.fetch_add(1, Ordering::SeqCst);
        Ok(self.read().data.keys().cloned().collect())
    }

    fn validate(&self, value: &V) -> Result<()> {
        let state = self.read();
        let rejected = state
            .invalid
            .iter()
            .filter_map(|key| state.data.get(key))
            .any(|stored| same_value(stored, value));
        if rejected {
            return Err(Error::ValidationError("value marked invalid".to_string()));
        }
        Ok(())
    }
}

fn same_value<V: CacheValue>(a: &V, b: &V) -> bool {
    match (serde_json::to_vec(a), serde_json::to_vec(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

impl<V: CacheValue> WritableDataSource for InMemorySource<V> {
    async fn store(&self, key: &str, value: &V) -> Result<()> {
        self.counters.store.fetch_add(1, Ordering::SeqCst);
        let mut state = self.write();
        if state.fail_writes {
            return Err(Error::SourceError(format!("store failed for {}", key)));
        }
        state.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.counters.remove.fetch_add(1, Ordering::SeqCst);
        let mut state = self.write();
        if state.fail_writes {
            return Err(Error::SourceError(format!("remove failed for {}", key)));
        }
        state.data.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_batch_skips_missing() {
        let source = InMemorySource::with_entries([("a", 1u32), ("b", 2u32)]);
        let loaded = source
            .load_batch(&["a".to_string(), "zzz".to_string()])
            .await
            .expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("a"), Some(&1));
        assert_eq!(source.calls().load_batch, 1);
    }

    #[tokio::test]
    async fn test_failing_key_fails_batch() {
        let source = InMemorySource::with_entries([("a", 1u32), ("b", 2u32)]);
        source.fail_key("b");
        assert!(source.load_one("a").await.expect("load").is_some());
        let err = source
            .load_batch(&["a".to_string(), "b".to_string()])
            .await
            .expect_err("b fails");
        assert!(matches!(err, Error::SourceError(_)));
    }

    #[tokio::test]
    async fn test_mark_invalid_rejects_value() {
        let source = InMemorySource::with_entries([("a", 1u32), ("b", 2u32)]);
        source.mark_invalid("b");
        assert!(source.validate(&1).is_ok());
        assert!(matches!(source.validate(&2), Err(Error::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_store_and_remove() {
        let source: InMemorySource<String> = InMemorySource::new();
        source.store("k", &"v".to_string()).await.expect("store");
        assert_eq!(source.get("k"), Some("v".to_string()));
        source.remove("k").await.expect("remove");
        assert!(source.is_empty());

        source.fail_writes(true);
        assert!(source.store("k", &"v".to_string()).await.is_err());
        assert_eq!(source.calls().store, 2);
    }

    #[tokio::test]
    async fn test_list_keys_sorted() {
        let source = InMemorySource::with_entries([("b", 2u32), ("a", 1u32)]);
        assert_eq!(source.list_keys().await.expect("keys"), vec!["a", "b"]);
    }
}
