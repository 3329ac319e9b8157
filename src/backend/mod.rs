//! Cache backend abstraction.
//!
//! A backend is the network-facing key-value service (Redis in production,
//! an in-process map in tests). Everything above this layer speaks bytes
//! through [`CacheBackend`]; typing and serialization live in
//! [`crate::client`].

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "inmemory")]
mod inmemory;
#[cfg(feature = "redis")]
mod redis_backend;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::{RedisBackend, RedisConfig};

/// Remaining lifetime of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist.
    Missing,
    /// Key exists without an expiration.
    Persistent,
    /// Key expires after the given duration.
    Expires(Duration),
}

/// One command in a pipelined or transactional batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Set only if the key is absent (`SET NX`).
    SetIfAbsent {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Set only if the key is present (`SET XX`).
    SetIfPresent {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Replace the value only if it currently equals `expected`.
    CompareAndSwap {
        key: String,
        expected: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    IncrementBy {
        key: String,
        delta: i64,
    },
}

impl BatchOp {
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Set { key, .. }
            | BatchOp::SetIfAbsent { key, .. }
            | BatchOp::SetIfPresent { key, .. }
            | BatchOp::CompareAndSwap { key, .. }
            | BatchOp::Delete { key }
            | BatchOp::Expire { key, .. }
            | BatchOp::IncrementBy { key, .. } => key,
        }
    }
}

/// Reply to one [`BatchOp`], in submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchReply {
    /// Unconditional set completed.
    Ok,
    /// Conditional op applied or not; delete/expire affected the key or not.
    Applied(bool),
    /// Counter value after an increment.
    Int(i64),
}

/// Trait for cache backend implementations.
///
/// Methods return `Send` futures so backends can be driven from background
/// tasks (write-behind worker, scheduled reload loop). Implementors can use
/// plain `async fn` in their impl blocks.
///
/// Key scanning must be cursor based: `scan` is the only enumeration
/// primitive and never lists the whole keyspace in one call.
pub trait CacheBackend: Clone + Send + Sync + 'static {
    /// Get raw bytes. `None` on miss.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Set raw bytes with optional TTL.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a key. Returns whether it existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Delete many keys. Returns how many existed.
    fn delete_many(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Set an expiration. Returns false if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    fn ttl(&self, key: &str) -> impl Future<Output = Result<KeyTtl>> + Send;

    /// Add `delta` to an integer counter, creating it at 0 if absent.
    fn incr_by(&self, key: &str, delta: i64) -> impl Future<Output = Result<i64>> + Send;

    // ---------------------------------------------------------------- lists

    /// Push to the head. Returns the new length.
    fn lpush(&self, key: &str, values: Vec<Vec<u8>>) -> impl Future<Output = Result<u64>> + Send;

    /// Push to the tail. Returns the new length.
    fn rpush(&self, key: &str, values: Vec<Vec<u8>>) -> impl Future<Output = Result<u64>> + Send;

    /// Inclusive range with Redis negative-index semantics.
    fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>>> + Send;

    /// Keep only the inclusive range.
    fn ltrim(&self, key: &str, start: i64, stop: i64) -> impl Future<Output = Result<()>> + Send;

    fn llen(&self, key: &str) -> impl Future<Output = Result<u64>> + Send;

    fn lpop(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    // ----------------------------------------------------------------- sets

    /// Add members. Returns how many were new.
    fn sadd(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Remove members. Returns how many were present.
    fn srem(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send;

    fn smembers(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn sismember(&self, key: &str, member: &str) -> impl Future<Output = Result<bool>> + Send;

    fn sunion(&self, keys: &[String]) -> impl Future<Output = Result<Vec<String>>> + Send;

    // --------------------------------------------------------------- hashes

    /// Set a field. Returns true if the field is new.
    fn hset(
        &self,
        key: &str,
        field: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn hget(&self, key: &str, field: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    fn hgetall(&self, key: &str) -> impl Future<Output = Result<HashMap<String, Vec<u8>>>> + Send;

    /// Delete fields. Returns how many existed.
    fn hdel(&self, key: &str, fields: &[String]) -> impl Future<Output = Result<u64>> + Send;

    // ------------------------------------------------------ scan & batches

    /// One cursor step of a pattern scan. A returned cursor of 0 ends the
    /// iteration. Keys deleted between steps must not hide keys that have
    /// not been returned yet.
    fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> impl Future<Output = Result<(u64, Vec<String>)>> + Send;

    /// Set only if absent. Returns whether the value was written.
    fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Set only if present. Returns whether the value was written.
    fn set_xx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically replace the value if it equals `expected`.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Run a batch in one round trip. With `atomic`, as a transaction.
    ///
    /// An error means no reply is returned. The in-memory backend also
    /// restores every key the batch touched.
    fn execute(
        &self,
        ops: Vec<BatchOp>,
        atomic: bool,
    ) -> impl Future<Output = Result<Vec<BatchReply>>> + Send;

    /// Remove every key in the current database.
    fn flush_db(&self) -> impl Future<Output = Result<()>> + Send;

    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send;
}
