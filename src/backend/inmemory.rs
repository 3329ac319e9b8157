//! In-memory cache backend.
//!
//! Mirrors the subset of Redis semantics the engine relies on: lazy expiry,
//! typed values (string/list/set/hash), glob `SCAN`, conditional sets and
//! pipelines. Used for tests and single-process deployments.

use super::{BatchOp, BatchReply, CacheBackend, KeyTtl};
use crate::error::{Error, Result};
use crate::key::matches_pattern;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Debug)]
enum Stored {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<String>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Stored, ttl: Option<Duration>) -> Self {
        Entry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

/// In-memory backend backed by a sharded concurrent map.
///
/// Cheap to clone: clones share the same store.
///
/// # Example
///
/// ```
/// # use cache_engine::backend::{CacheBackend, InMemoryBackend};
/// # async fn example() -> cache_engine::Result<()> {
/// let backend = InMemoryBackend::new();
/// backend.set("key", b"value".to_vec(), None).await?;
/// assert_eq!(backend.get("key").await?, Some(b"value".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, Entry>>,
    // Serializes transactional batches against each other.
    txn: Arc<Mutex<()>>,
    // Open scan cursors, each mapped to the last key it returned.
    cursors: Arc<DashMap<u64, String>>,
    next_cursor: Arc<AtomicU64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys.
    pub async fn len(&self) -> usize {
        self.store.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn purge_if_expired(&self, key: &str) {
        let expired = self.store.get(key).map_or(false, |e| e.is_expired());
        if expired {
            self.store.remove_if(key, |_, e| e.is_expired());
        }
    }

    fn get_sync(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.purge_if_expired(key);
        match self.store.get(key) {
            Some(entry) => match &entry.value {
                Stored::Bytes(bytes) => Ok(Some(bytes.clone())),
                _ => Err(Error::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    fn set_sync(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.store
            .insert(key.to_string(), Entry::new(Stored::Bytes(value), ttl));
    }

    fn delete_sync(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.store.remove(key).is_some()
    }

    fn exists_sync(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.store.contains_key(key)
    }

    fn expire_sync(&self, key: &str, ttl: Duration) -> bool {
        self.purge_if_expired(key);
        match self.store.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn incr_by_sync(&self, key: &str, delta: i64) -> Result<i64> {
        self.purge_if_expired(key);
        match self.store.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = match &entry.value {
                    Stored::Bytes(bytes) => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.trim().parse::<i64>().ok())
                        .ok_or_else(|| {
                            Error::BackendError(format!(
                                "Value at {} is not an integer",
                                key
                            ))
                        })?,
                    _ => return Err(Error::WrongType(key.to_string())),
                };
                let next = current.checked_add(delta).ok_or_else(|| {
                    Error::BackendError(format!("Increment would overflow for {}", key))
                })?;
                entry.value = Stored::Bytes(next.to_string().into_bytes());
                Ok(next)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(
                    Stored::Bytes(delta.to_string().into_bytes()),
                    None,
                ));
                Ok(delta)
            }
        }
    }

    fn set_conditional_sync(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        require_present: bool,
    ) -> bool {
        self.purge_if_expired(key);
        match self.store.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if require_present => {
                occupied.insert(Entry::new(Stored::Bytes(value), ttl));
                true
            }
            MapEntry::Vacant(vacant) if !require_present => {
                vacant.insert(Entry::new(Stored::Bytes(value), ttl));
                true
            }
            _ => false,
        }
    }

    fn compare_and_swap_sync(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> bool {
        self.purge_if_expired(key);
        match self.store.get_mut(key) {
            Some(mut entry) => {
                let matches = matches!(
                    &entry.value,
                    Stored::Bytes(current) if current.as_slice() == expected
                );
                if matches {
                    *entry = Entry::new(Stored::Bytes(value), ttl);
                }
                matches
            }
            None => false,
        }
    }

    /// Run `f` against the list at `key`, creating it when `create` is set.
    fn with_list<T>(
        &self,
        key: &str,
        create: bool,
        f: impl FnOnce(&mut VecDeque<Vec<u8>>) -> T,
    ) -> Result<Option<T>> {
        self.purge_if_expired(key);
        if create {
            self.store
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Stored::List(VecDeque::new()), None));
        }
        let result = match self.store.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Stored::List(list) => Some(f(list)),
                _ => return Err(Error::WrongType(key.to_string())),
            },
            None => None,
        };
        self.store.remove_if(key, |_, e| match &e.value {
            Stored::List(list) => list.is_empty(),
            _ => false,
        });
        Ok(result)
    }

    fn with_set<T>(
        &self,
        key: &str,
        create: bool,
        f: impl FnOnce(&mut HashSet<String>) -> T,
    ) -> Result<Option<T>> {
        self.purge_if_expired(key);
        if create {
            self.store
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Stored::Set(HashSet::new()), None));
        }
        let result = match self.store.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Stored::Set(set) => Some(f(set)),
                _ => return Err(Error::WrongType(key.to_string())),
            },
            None => None,
        };
        self.store.remove_if(key, |_, e| match &e.value {
            Stored::Set(set) => set.is_empty(),
            _ => false,
        });
        Ok(result)
    }

    fn with_hash<T>(
        &self,
        key: &str,
        create: bool,
        f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T,
    ) -> Result<Option<T>> {
        self.purge_if_expired(key);
        if create {
            self.store
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Stored::Hash(HashMap::new()), None));
        }
        let result = match self.store.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Stored::Hash(hash) => Some(f(hash)),
                _ => return Err(Error::WrongType(key.to_string())),
            },
            None => None,
        };
        self.store.remove_if(key, |_, e| match &e.value {
            Stored::Hash(hash) => hash.is_empty(),
            _ => false,
        });
        Ok(result)
    }

    fn apply_op(&self, op: BatchOp) -> Result<BatchReply> {
        Ok(match op {
            BatchOp::Set { key, value, ttl } => {
                self.set_sync(&key, value, ttl);
                BatchReply::Ok
            }
            BatchOp::SetIfAbsent { key, value, ttl } => {
                BatchReply::Applied(self.set_conditional_sync(&key, value, ttl, false))
            }
            BatchOp::SetIfPresent { key, value, ttl } => {
                BatchReply::Applied(self.set_conditional_sync(&key, value, ttl, true))
            }
            BatchOp::CompareAndSwap {
                key,
                expected,
                value,
                ttl,
            } => BatchReply::Applied(self.compare_and_swap_sync(&key, &expected, value, ttl)),
            BatchOp::Delete { key } => BatchReply::Applied(self.delete_sync(&key)),
            BatchOp::Expire { key, ttl } => BatchReply::Applied(self.expire_sync(&key, ttl)),
            BatchOp::IncrementBy { key, delta } => BatchReply::Int(self.incr_by_sync(&key, delta)?),
        })
    }
}

/// Resolve a Redis inclusive range against a list of `len` items.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.get_sync(key)?;
        debug!(
            "✓ InMemory GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.set_sync(key, value, ttl);
        debug!("✓ InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.delete_sync(key))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        Ok(keys.iter().filter(|k| self.delete_sync(k)).count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.exists_sync(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.expire_sync(key, ttl))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.purge_if_expired(key);
        Ok(match self.store.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
                None => KeyTtl::Persistent,
            },
            None => KeyTtl::Missing,
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.incr_by_sync(key, delta)
    }

    async fn lpush(&self, key: &str, values: Vec<Vec<u8>>) -> Result<u64> {
        let len = self.with_list(key, true, |list| {
            for v in values {
                list.push_front(v);
            }
            list.len() as u64
        })?;
        Ok(len.unwrap_or(0))
    }

    async fn rpush(&self, key: &str, values: Vec<Vec<u8>>) -> Result<u64> {
        let len = self.with_list(key, true, |list| {
            list.extend(values);
            list.len() as u64
        })?;
        Ok(len.unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let items = self.with_list(key, false, |list| {
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect::<Vec<_>>(),
                None => Vec::new(),
            }
        })?;
        Ok(items.unwrap_or_default())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.with_list(key, false, |list| match resolve_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => list.clear(),
        })?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        Ok(self
            .with_list(key, false, |list| list.len() as u64)?
            .unwrap_or(0))
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_list(key, false, |list| list.pop_front())?.flatten())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let added = self.with_set(key, true, |set| {
            members.iter().filter(|m| set.insert((*m).clone())).count() as u64
        })?;
        Ok(added.unwrap_or(0))
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        let removed = self.with_set(key, false, |set| {
            members.iter().filter(|m| set.remove(m.as_str())).count() as u64
        })?;
        Ok(removed.unwrap_or(0))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members = self.with_set(key, false, |set| set.iter().cloned().collect::<Vec<_>>())?;
        Ok(members.unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .with_set(key, false, |set| set.contains(member))?
            .unwrap_or(false))
    }

    async fn sunion(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut union = HashSet::new();
        for key in keys {
            if let Some(members) = self.with_set(key, false, |set| set.clone())? {
                union.extend(members);
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool> {
        let created = self.with_hash(key, true, |hash| {
            hash.insert(field.to_string(), value).is_none()
        })?;
        Ok(created.unwrap_or(false))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .with_hash(key, false, |hash| hash.get(field).cloned())?
            .flatten())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self
            .with_hash(key, false, |hash| hash.clone())?
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        let removed = self.with_hash(key, false, |hash| {
            fields.iter().filter(|f| hash.remove(f.as_str()).is_some()).count() as u64
        })?;
        Ok(removed.unwrap_or(0))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        // A cursor resumes after the last key it returned, so keys deleted
        // between pages never shift the remaining ones out of the walk.
        let after = if cursor == 0 {
            None
        } else {
            match self.cursors.remove(&cursor) {
                Some((_, last)) => Some(last),
                None => return Ok((0, Vec::new())),
            }
        };

        let mut remaining: Vec<String> = self
            .store
            .iter()
            .filter(|e| !e.value().is_expired())
            .filter(|e| after.as_deref().map_or(true, |last| e.key().as_str() > last))
            .map(|e| e.key().clone())
            .collect();
        remaining.sort();

        let take = count.max(1).min(remaining.len());
        let next = if take < remaining.len() {
            let id = self.next_cursor.fetch_add(1, Ordering::Relaxed) + 1;
            self.cursors.insert(id, remaining[take - 1].clone());
            id
        } else {
            0
        };
        let page = remaining
            .into_iter()
            .take(take)
            .filter(|k| matches_pattern(pattern, k))
            .collect();
        Ok((next, page))
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.set_conditional_sync(key, value, ttl, false))
    }

    async fn set_xx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.set_conditional_sync(key, value, ttl, true))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        Ok(self.compare_and_swap_sync(key, &expected, value, ttl))
    }

    async fn execute(&self, ops: Vec<BatchOp>, atomic: bool) -> Result<Vec<BatchReply>> {
        let _guard = if atomic {
            Some(self.txn.lock().await)
        } else {
            None
        };
        let count = ops.len();

        // Touched entries as they were before the batch, restored if an op fails.
        let mut before: HashMap<String, Option<Entry>> = HashMap::new();
        for op in &ops {
            if !before.contains_key(op.key()) {
                let entry = self.store.get(op.key()).map(|e| e.value().clone());
                before.insert(op.key().to_string(), entry);
            }
        }

        let mut replies = Vec::with_capacity(count);
        for op in ops {
            match self.apply_op(op) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    for (key, entry) in before {
                        match entry {
                            Some(entry) => {
                                self.store.insert(key, entry);
                            }
                            None => {
                                self.store.remove(&key);
                            }
                        }
                    }
                    warn!("✗ InMemory EXEC of {} ops rolled back: {}", count, e);
                    return Err(e);
                }
            }
        }
        debug!("✓ InMemory EXEC {} ops (atomic: {})", count, atomic);
        Ok(replies)
    }

    async fn flush_db(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory FLUSHDB executed - all cache cleared!");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
