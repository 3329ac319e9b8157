//! Redis cache backend implementation.

use super::{BatchOp, BatchReply, CacheBackend, KeyTtl};
use crate::error::{Error, Result};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, PoolConfig as PoolSizing, Runtime};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

/// Default Redis connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: usize = 16;

/// Keys examined per SCAN round trip.
const SCAN_COUNT_HINT: usize = 100;

/// Replace KEYS[1] with ARGV[2] only if it currently equals ARGV[1].
/// ARGV[3] is a TTL in milliseconds, 0 for none.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
  if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  else
    redis.call('SET', KEYS[1], ARGV[2])
  end
  return 1
end
return 0
"#;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g., "redis://localhost:6379/0"
    pub connection_timeout: Duration,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl RedisConfig {
    /// Read `REDIS_URL` and `REDIS_POOL_SIZE`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = RedisConfig::default();
        RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),
            pool_size: std::env::var("REDIS_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(defaults.pool_size),
            connection_timeout: defaults.connection_timeout,
        }
    }
}

/// Redis backend with connection pooling and async operations.
///
/// # Example
///
/// ```no_run
/// # use cache_engine::backend::{RedisBackend, RedisConfig, CacheBackend};
/// # use cache_engine::error::Result;
/// # async fn example() -> Result<()> {
/// let backend = RedisBackend::new(RedisConfig::default())?;
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub fn new(config: RedisConfig) -> Result<Self> {
        let mut sizing = PoolSizing::new(config.pool_size);
        sizing.timeouts.wait = Some(config.connection_timeout);
        sizing.timeouts.create = Some(config.connection_timeout);

        let mut pool_config = PoolConfig::from_url(config.url.clone());
        pool_config.pool = Some(sizing);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))?;

        info!(
            "✓ Redis backend initialized with server: {} (pool size: {})",
            config.url, config.pool_size
        );

        Ok(RedisBackend { pool })
    }

    /// Create from a connection URL, pool size from `REDIS_POOL_SIZE`.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let config = RedisConfig {
            url: url.into(),
            ..RedisConfig::from_env()
        };
        Self::new(config)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn set_cmd(key: &str, value: &[u8], ttl: Option<Duration>, condition: Option<&str>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(condition) = condition {
        cmd.arg(condition);
    }
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(ttl_millis(ttl));
    }
    cmd
}

fn reply_int(value: &redis::Value, key: &str) -> Result<i64> {
    match value {
        redis::Value::Int(n) => Ok(*n),
        other => Err(Error::BackendError(format!(
            "Unexpected pipeline reply for {}: {:?}",
            key, other
        ))),
    }
}

fn to_reply(op: &BatchOp, value: &redis::Value) -> Result<BatchReply> {
    Ok(match op {
        BatchOp::Set { .. } => BatchReply::Ok,
        BatchOp::SetIfAbsent { .. } | BatchOp::SetIfPresent { .. } => {
            BatchReply::Applied(!matches!(value, redis::Value::Nil))
        }
        BatchOp::CompareAndSwap { key, .. }
        | BatchOp::Delete { key }
        | BatchOp::Expire { key, .. } => BatchReply::Applied(reply_int(value, key)? > 0),
        BatchOp::IncrementBy { key, .. } => BatchReply::Int(reply_int(value, key)?),
    })
}

impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| {
            Error::BackendError(format!("Redis GET failed for key {}: {}", key, e))
        })?;
        debug!(
            "✓ Redis GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = set_cmd(key, &value, ttl, None)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET failed for key {}: {}", key, e)))?;
        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(|e| {
            Error::BackendError(format!("Redis DEL failed for key {}: {}", key, e))
        })?;
        debug!("✓ Redis DEL {}", key);
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        // UNLINK frees memory off the main thread.
        let removed: u64 = redis::cmd("UNLINK")
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis UNLINK failed: {}", e)))?;
        debug!("✓ Redis UNLINK {} keys ({} existed)", keys.len(), removed);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn().await?;
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut *conn).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.incr(key, delta).await?)
    }

    async fn lpush(&self, key: &str, values: Vec<Vec<u8>>) -> Result<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut conn = self.conn().await?;
        Ok(conn.lpush(key, values).await?)
    }

    async fn rpush(&self, key: &str, values: Vec<Vec<u8>>) -> Result<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut conn = self.conn().await?;
        Ok(conn.rpush(key, values).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.lpop(key, None).await?)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.sadd(key, members).await?)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.srem(key, members).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.sismember(key, member).await?)
    }

    async fn sunion(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        Ok(conn.sunion(keys).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let created: i64 = conn.hset(key, field, value).await?;
        Ok(created > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.hdel(key, fields).await?)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(if count == 0 { SCAN_COUNT_HINT } else { count })
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Failed to scan keys matching {}: {}", pattern, e))
            })?;
        Ok((next, keys))
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = set_cmd(key, &value, ttl, Some("NX"))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_xx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = set_cmd(key, &value, ttl, Some("XX"))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(COMPARE_AND_SWAP_SCRIPT);
        let swapped: i64 = script
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl.map(ttl_millis).unwrap_or(0))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis CAS failed for key {}: {}", key, e)))?;
        Ok(swapped == 1)
    }

    async fn execute(&self, ops: Vec<BatchOp>, atomic: bool) -> Result<Vec<BatchReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for op in &ops {
            match op {
                BatchOp::Set { key, value, ttl } => {
                    pipe.add_command(set_cmd(key, value, *ttl, None));
                }
                BatchOp::SetIfAbsent { key, value, ttl } => {
                    pipe.add_command(set_cmd(key, value, *ttl, Some("NX")));
                }
                BatchOp::SetIfPresent { key, value, ttl } => {
                    pipe.add_command(set_cmd(key, value, *ttl, Some("XX")));
                }
                BatchOp::CompareAndSwap {
                    key,
                    expected,
                    value,
                    ttl,
                } => {
                    pipe.cmd("EVAL")
                        .arg(COMPARE_AND_SWAP_SCRIPT)
                        .arg(1)
                        .arg(key)
                        .arg(expected)
                        .arg(value)
                        .arg(ttl.map(ttl_millis).unwrap_or(0));
                }
                BatchOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                BatchOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl));
                }
                BatchOp::IncrementBy { key, delta } => {
                    pipe.cmd("INCRBY").arg(key).arg(*delta);
                }
            }
        }

        let mut conn = self.conn().await?;
        let values: Vec<redis::Value> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis pipeline failed: {}", e)))?;

        if values.len() != ops.len() {
            return Err(Error::BackendError(format!(
                "Pipeline returned {} replies for {} commands",
                values.len(),
                ops.len()
            )));
        }

        debug!("✓ Redis EXEC {} ops (atomic: {})", ops.len(), atomic);
        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| to_reply(op, value))
            .collect()
    }

    async fn flush_db(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;
        warn!("⚠ Redis FLUSHDB executed - all cache cleared!");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => {
                let pong: std::result::Result<String, _> =
                    redis::cmd("PING").query_async(&mut *conn).await;
                Ok(matches!(pong, Ok(ref p) if p == "PONG"))
            }
            Err(_) => Ok(false),
        }
    }
}
