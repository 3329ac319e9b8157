//! Typed primitive client over a [`CacheBackend`].
//!
//! Every value written through [`CacheClient::set`] (and the typed batch
//! operations) is encoded with the configured [`Codec`], passed through the
//! registered data transformers, and wrapped in the transform envelope.
//! Reads undo the same steps. Lists, sets and hashes carry plain codec
//! output; transformers only apply to whole values.

use crate::backend::{BatchOp, BatchReply, CacheBackend, KeyTtl};
use crate::error::{Error, Result};
use crate::hooks::TransformerManager;
use crate::serialization::{unwrap_envelope, wrap_envelope, Codec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Keys examined per `SCAN` step during pattern operations.
pub const SCAN_BATCH_SIZE: usize = 100;

/// Typed cache client.
///
/// Cheap to clone; clones share the backend connection and the transformer
/// registry.
#[derive(Clone)]
pub struct CacheClient<B: CacheBackend> {
    backend: B,
    codec: Codec,
    transformers: Arc<TransformerManager>,
}

impl<B: CacheBackend> CacheClient<B> {
    pub fn new(backend: B) -> Self {
        CacheClient {
            backend,
            codec: Codec::default(),
            transformers: Arc::new(TransformerManager::new()),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Share a transformer registry with other components.
    pub fn with_transformers(mut self, transformers: Arc<TransformerManager>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn transformers(&self) -> &Arc<TransformerManager> {
        &self.transformers
    }

    /// Encode a value the way it is stored under `key`.
    pub fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<Vec<u8>> {
        let bytes = self.codec.encode(value)?;
        let (applied, bytes) = self.transformers.apply(key, bytes)?;
        wrap_envelope(&applied, bytes)
    }

    /// Decode bytes stored under `key`.
    pub fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T> {
        let (applied, payload) = unwrap_envelope(bytes)?;
        if applied.is_empty() {
            return self.codec.decode(payload);
        }
        let restored = self.transformers.restore(key, &applied, payload.to_vec())?;
        self.codec.decode(&restored)
    }

    // -------------------------------------------------------------- values

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = self.encode(key, value)?;
        self.backend.set(key, bytes, ttl).await
    }

    /// Fetch and decode a value.
    ///
    /// # Errors
    ///
    /// - `Error::CacheMiss`: key absent or expired
    /// - `Error::DeserializationError`: stored bytes are malformed
    /// - `Error::TransformError`: a recorded transformer is missing or failed
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        match self.backend.get(key).await? {
            Some(bytes) => self.decode(key, &bytes),
            None => Err(Error::CacheMiss(key.to_string())),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    pub async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.backend.delete_many(keys).await
    }

    /// Collect every key matching `pattern` with cursor-based scanning.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page) = self.backend.scan(cursor, pattern, SCAN_BATCH_SIZE).await?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Delete every key matching `pattern`.
    ///
    /// The scan completes before anything is deleted, then keys go in
    /// chunks of [`SCAN_BATCH_SIZE`]. Returns the number of keys removed.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let keys = self.scan_keys(pattern).await?;
        let mut removed = 0;
        for chunk in keys.chunks(SCAN_BATCH_SIZE) {
            removed += self.backend.delete_many(chunk).await?;
        }
        debug!("✓ Deleted {} keys matching {}", removed, pattern);
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.backend.expire(key, ttl).await
    }

    pub async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.backend.ttl(key).await
    }

    // ------------------------------------------------------------ counters

    pub async fn increment(&self, key: &str) -> Result<i64> {
        self.backend.incr_by(key, 1).await
    }

    pub async fn increment_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend.incr_by(key, delta).await
    }

    pub async fn decrement(&self, key: &str) -> Result<i64> {
        self.backend.incr_by(key, -1).await
    }

    pub async fn decrement_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend.incr_by(key, -delta).await
    }

    // --------------------------------------------------------------- lists

    pub async fn lpush<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64> {
        let encoded = self.encode_all(values)?;
        self.backend.lpush(key, encoded).await
    }

    pub async fn rpush<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64> {
        let encoded = self.encode_all(values)?;
        self.backend.rpush(key, encoded).await
    }

    pub async fn lrange<T: DeserializeOwned>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<T>> {
        self.backend
            .lrange(key, start, stop)
            .await?
            .iter()
            .map(|bytes| self.codec.decode(bytes))
            .collect()
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.backend.ltrim(key, start, stop).await
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        self.backend.llen(key).await
    }

    pub async fn lpop<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.lpop(key).await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------- sets

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.backend.sadd(key, members).await
    }

    pub async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        self.backend.srem(key, members).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.backend.smembers(key).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.backend.sismember(key, member).await
    }

    pub async fn sunion(&self, keys: &[String]) -> Result<Vec<String>> {
        self.backend.sunion(keys).await
    }

    // -------------------------------------------------------------- hashes

    pub async fn hset<T: Serialize>(&self, key: &str, field: &str, value: &T) -> Result<bool> {
        let bytes = self.codec.encode(value)?;
        self.backend.hset(key, field, bytes).await
    }

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        match self.backend.hget(key, field).await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<String, T>> {
        self.backend
            .hgetall(key)
            .await?
            .into_iter()
            .map(|(field, bytes)| -> Result<(String, T)> {
                Ok((field, self.codec.decode(&bytes)?))
            })
            .collect()
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        self.backend.hdel(key, fields).await
    }

    // --------------------------------------------------- conditional writes

    /// Set only if absent. Returns whether the value was written.
    pub async fn set_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let bytes = self.encode(key, value)?;
        self.backend.set_nx(key, bytes, ttl).await
    }

    /// Set only if present. Returns whether the value was written.
    pub async fn set_if_present<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let bytes = self.encode(key, value)?;
        self.backend.set_xx(key, bytes, ttl).await
    }

    /// Replace the value under `key` only if it currently decodes to
    /// `expected`.
    ///
    /// Comparison happens on decoded values so non-deterministic
    /// transformers (encryption) do not defeat it; the swap itself is an
    /// atomic compare against the exact stored bytes that were read.
    pub async fn compare_and_swap<T: Serialize + DeserializeOwned>(
        &self,
        key: &str,
        expected: &T,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let current_raw = match self.backend.get(key).await? {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        let current: T = self.decode(key, &current_raw)?;
        if self.codec.encode(&current)? != self.codec.encode(expected)? {
            return Ok(false);
        }
        let bytes = self.encode(key, value)?;
        self.backend
            .compare_and_swap(key, current_raw, bytes, ttl)
            .await
    }

    // ------------------------------------------------------------- batches

    /// Start a pipelined batch (one round trip, not atomic).
    pub fn pipeline(&self) -> Batch<'_, B> {
        Batch::new(self, false)
    }

    /// Start a transactional batch (MULTI/EXEC).
    pub fn transaction(&self) -> Batch<'_, B> {
        Batch::new(self, true)
    }

    pub async fn flush_db(&self) -> Result<()> {
        self.backend.flush_db().await
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.backend.health_check().await
    }

    fn encode_all<T: Serialize>(&self, values: &[T]) -> Result<Vec<Vec<u8>>> {
        values.iter().map(|v| self.codec.encode(v)).collect()
    }
}

/// Batch of commands sent in one round trip.
///
/// # Example
///
/// ```
/// # use cache_engine::backend::InMemoryBackend;
/// # use cache_engine::client::CacheClient;
/// # async fn example() -> cache_engine::Result<()> {
/// let client = CacheClient::new(InMemoryBackend::new());
/// let mut batch = client.transaction();
/// batch.set("a", &1u32, None)?.set_if_absent("b", &2u32, None)?.delete("c");
/// let replies = batch.execute().await?;
/// assert_eq!(replies.len(), 3);
/// # Ok(())
/// # }
/// ```
pub struct Batch<'a, B: CacheBackend> {
    client: &'a CacheClient<B>,
    ops: Vec<BatchOp>,
    atomic: bool,
}

impl<'a, B: CacheBackend> Batch<'a, B> {
    fn new(client: &'a CacheClient<B>, atomic: bool) -> Self {
        Batch {
            client,
            ops: Vec::new(),
            atomic,
        }
    }

    pub fn set<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<&mut Self> {
        let value = self.client.encode(key, value)?;
        self.ops.push(BatchOp::Set {
            key: key.to_string(),
            value,
            ttl,
        });
        Ok(self)
    }

    pub fn set_if_absent<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<&mut Self> {
        let value = self.client.encode(key, value)?;
        self.ops.push(BatchOp::SetIfAbsent {
            key: key.to_string(),
            value,
            ttl,
        });
        Ok(self)
    }

    pub fn set_if_present<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<&mut Self> {
        let value = self.client.encode(key, value)?;
        self.ops.push(BatchOp::SetIfPresent {
            key: key.to_string(),
            value,
            ttl,
        });
        Ok(self)
    }

    /// Raw compare-and-swap against the exact stored bytes.
    pub fn compare_and_swap_raw(
        &mut self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> &mut Self {
        self.ops.push(BatchOp::CompareAndSwap {
            key: key.to_string(),
            expected,
            value,
            ttl,
        });
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            key: key.to_string(),
        });
        self
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.ops.push(BatchOp::Expire {
            key: key.to_string(),
            ttl,
        });
        self
    }

    pub fn increment_by(&mut self, key: &str, delta: i64) -> &mut Self {
        self.ops.push(BatchOp::IncrementBy {
            key: key.to_string(),
            delta,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Send the batch. Replies come back in submission order.
    pub async fn execute(self) -> Result<Vec<BatchReply>> {
        if self.ops.is_empty() {
            return Ok(Vec::new());
        }
        self.client.backend.execute(self.ops, self.atomic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::transformers::CompressionTransformer;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn user(id: u32) -> User {
        User {
            id,
            name: format!("user-{}", id),
        }
    }

    #[tokio::test]
    async fn test_get_miss_is_cache_miss() {
        let client = CacheClient::new(InMemoryBackend::new());
        let err = client.get::<User>("user:1").await.expect_err("miss");
        assert!(err.is_cache_miss());
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let client = CacheClient::new(InMemoryBackend::new());
        client.set("user:1", &user(1), None).await.expect("set");
        assert_eq!(client.get::<User>("user:1").await.expect("get"), user(1));
    }

    #[tokio::test]
    async fn test_malformed_value_is_not_a_miss() {
        let backend = InMemoryBackend::new();
        backend
            .set("user:1", b"{broken".to_vec(), None)
            .await
            .expect("set");
        let client = CacheClient::new(backend);
        let err = client.get::<User>("user:1").await.expect_err("bad data");
        assert!(matches!(err, Error::DeserializationError(_)));
    }

    #[tokio::test]
    async fn test_delete_pattern_uses_scan() {
        let client = CacheClient::new(InMemoryBackend::new());
        for i in 0..250 {
            client
                .set(&format!("session:{}", i), &i, None)
                .await
                .expect("set");
        }
        client.set("user:1", &user(1), None).await.expect("set");

        assert_eq!(client.delete_pattern("session:*").await.expect("delete"), 250);
        assert!(client.scan_keys("session:*").await.expect("scan").is_empty());
        assert!(client.exists("user:1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_delete_pattern_with_interleaved_keys() {
        let client = CacheClient::new(InMemoryBackend::new());
        for i in 0..250 {
            client.set(&format!("k:{:03}", i), &i, None).await.expect("set");
            client.set(&format!("k:{:03}:meta", i), &i, None).await.expect("set");
        }

        assert_eq!(client.delete_pattern("k:???").await.expect("delete"), 250);
        assert!(client.scan_keys("k:???").await.expect("scan").is_empty());
        assert_eq!(client.scan_keys("k:*:meta").await.expect("scan").len(), 250);
    }

    #[tokio::test]
    async fn test_counters() {
        let client = CacheClient::new(InMemoryBackend::new());
        assert_eq!(client.increment("hits").await.expect("incr"), 1);
        assert_eq!(client.increment_by("hits", 9).await.expect("incr"), 10);
        assert_eq!(client.decrement("hits").await.expect("decr"), 9);
        assert_eq!(client.decrement_by("hits", 4).await.expect("decr"), 5);
    }

    #[tokio::test]
    async fn test_typed_lists_and_hashes() {
        let client = CacheClient::new(InMemoryBackend::new());
        client.rpush("queue", &[user(1), user(2)]).await.expect("rpush");
        let users: Vec<User> = client.lrange("queue", 0, -1).await.expect("lrange");
        assert_eq!(users, vec![user(1), user(2)]);
        assert_eq!(client.lpop::<User>("queue").await.expect("lpop"), Some(user(1)));

        client.hset("profile", "age", &42u32).await.expect("hset");
        assert_eq!(client.hget::<u32>("profile", "age").await.expect("hget"), Some(42));
        let all: HashMap<String, u32> = client.hgetall("profile").await.expect("hgetall");
        assert_eq!(all.get("age"), Some(&42));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let client = CacheClient::new(InMemoryBackend::new());
        client.set("n", &1u32, None).await.expect("set");
        assert!(!client.compare_and_swap("n", &5u32, &2u32, None).await.expect("cas"));
        assert!(client.compare_and_swap("n", &1u32, &2u32, None).await.expect("cas"));
        assert_eq!(client.get::<u32>("n").await.expect("get"), 2);
        assert!(!client.compare_and_swap("absent", &1u32, &2u32, None).await.expect("cas"));
    }

    #[tokio::test]
    async fn test_transaction_replies_in_order() {
        let client = CacheClient::new(InMemoryBackend::new());
        client.set("present", &0u8, None).await.expect("set");

        let mut batch = client.transaction();
        batch
            .set("a", &1u8, None)
            .expect("encode")
            .set_if_absent("present", &1u8, None)
            .expect("encode")
            .set_if_present("present", &2u8, None)
            .expect("encode")
            .increment_by("counter", 5);
        let replies = batch.execute().await.expect("execute");

        assert_eq!(
            replies,
            vec![
                BatchReply::Ok,
                BatchReply::Applied(false),
                BatchReply::Applied(true),
                BatchReply::Int(5)
            ]
        );
        assert_eq!(client.get::<u8>("present").await.expect("get"), 2);
    }

    #[tokio::test]
    async fn test_transformers_apply_on_write_and_restore_on_read() {
        let client = CacheClient::new(InMemoryBackend::new());
        client
            .transformers()
            .add(Arc::new(CompressionTransformer::new().with_min_size(0)));

        let big = User {
            id: 1,
            name: "x".repeat(4096),
        };
        client.set("big", &big, None).await.expect("set");

        let raw = client.backend().get("big").await.expect("get").expect("present");
        assert!(raw.starts_with(crate::serialization::ENVELOPE_MAGIC));
        assert!(raw.len() < 4096);
        assert_eq!(client.get::<User>("big").await.expect("get"), big);
    }
}
