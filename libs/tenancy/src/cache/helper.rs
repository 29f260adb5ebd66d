//! Tenant-scoped cache operations and the distributed lock.
//!
//! A lock is a key holding the owner's token, created with `SET NX` and
//! released by a server-side compare-and-delete.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use serde::de::DeserializeOwned;

use super::{CacheManager, CacheValue};
use crate::{Result, TenantCtx, TenantError};

const LOCK_PREFIX: &str = "lock:";

/// Deletes the lock key only if it still holds the caller's token.
static UNLOCK_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#,
    )
});

/// A member of a sorted set with its score.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Typed cache operations scoped to the tenant of a [`TenantCtx`].
///
/// Every operation picks the tenant's client and prefixes its keys through
/// the [`CacheManager`]. Once the manager is closed every operation fails
/// with `ClientClosed`.
#[derive(Clone, Debug)]
pub struct CacheHelper {
    manager: Arc<CacheManager>,
}

/// Redis rejects expiries that overflow when added to the server clock.
const MAX_TTL_MILLIS: u64 = 1 << 62;

/// `ttl` in milliseconds. Positive durations round up to at least 1ms so a
/// sub-millisecond TTL never becomes "no expiry" or "expire now".
fn ttl_millis(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        return 0;
    }
    u64::try_from(ttl.as_millis())
        .unwrap_or(MAX_TTL_MILLIS)
        .clamp(1, MAX_TTL_MILLIS)
}

fn encode_all<V: CacheValue>(key: &str, values: &[V]) -> Result<Vec<Vec<u8>>> {
    values
        .iter()
        .map(|v| {
            v.encode().map_err(|source| TenantError::Serialization {
                key: key.to_owned(),
                source,
            })
        })
        .collect()
}

impl CacheHelper {
    #[must_use]
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    fn target(&self, ctx: &TenantCtx, key: &str) -> Result<(ConnectionManager, String)> {
        let conn = self.manager.get_client_from_context(ctx).connection()?;
        Ok((conn, self.manager.with_tenant_prefix(ctx, key)))
    }

    fn encode(key: &str, value: &(impl CacheValue + ?Sized)) -> Result<Vec<u8>> {
        value.encode().map_err(|source| TenantError::Serialization {
            key: key.to_owned(),
            source,
        })
    }

    fn cache_err(op: &'static str, key: String) -> impl FnOnce(RedisError) -> TenantError {
        move |source| TenantError::Cache { op, key, source }
    }

    /// Store `value` under `key`. A zero `ttl` stores without expiry.
    ///
    /// # Errors
    /// `Serialization` if the value cannot be encoded, `Cache` on store failure.
    pub async fn set(
        &self,
        ctx: &TenantCtx,
        key: &str,
        value: &(impl CacheValue + ?Sized),
        ttl: Duration,
    ) -> Result<()> {
        let (mut conn, key) = self.target(ctx, key)?;
        let bytes = Self::encode(&key, value)?;
        let res: redis::RedisResult<()> = if ttl.is_zero() {
            conn.set(&key, bytes).await
        } else {
            conn.pset_ex(&key, bytes, ttl_millis(ttl)).await
        };
        res.map_err(Self::cache_err("set", key))
    }

    /// The string stored under `key`, `None` if missing.
    ///
    /// # Errors
    /// `Cache` on store failure.
    pub async fn get(&self, ctx: &TenantCtx, key: &str) -> Result<Option<String>> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.get(&key).await.map_err(Self::cache_err("get", key))
    }

    /// Decode the JSON stored under `key`, `None` if missing.
    ///
    /// # Errors
    /// `Serialization` if the stored value is not valid JSON for `T`,
    /// `Cache` on store failure.
    pub async fn get_object<T: DeserializeOwned>(
        &self,
        ctx: &TenantCtx,
        key: &str,
    ) -> Result<Option<T>> {
        let (mut conn, key) = self.target(ctx, key)?;
        let raw: Option<Vec<u8>> = conn
            .get(&key)
            .await
            .map_err(Self::cache_err("get_object", key.clone()))?;
        raw.map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(|source| TenantError::Serialization { key, source })
    }

    /// Delete `keys`, returning how many existed.
    ///
    /// # Errors
    /// `Cache` on store failure.
    pub async fn delete(&self, ctx: &TenantCtx, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.get_client_from_context(ctx).connection()?;
        let prefixed: Vec<String> = keys
            .iter()
            .map(|k| self.manager.with_tenant_prefix(ctx, k))
            .collect();
        conn.del(&prefixed)
            .await
            .map_err(Self::cache_err("delete", prefixed.join(" ")))
    }

    /// # Errors
    /// `Cache` on store failure.
    pub async fn exists(&self, ctx: &TenantCtx, key: &str) -> Result<bool> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.exists(&key).await.map_err(Self::cache_err("exists", key))
    }

    /// Set the time to live of `key`. Returns `false` if the key does not exist.
    ///
    /// # Errors
    /// `Cache` on store failure.
    pub async fn expire(&self, ctx: &TenantCtx, key: &str, ttl: Duration) -> Result<bool> {
        let (mut conn, key) = self.target(ctx, key)?;
        let ms = i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX);
        conn.pexpire(&key, ms)
            .await
            .map_err(Self::cache_err("expire", key))
    }

    /// Increment the integer stored under `key`, returning the new value.
    ///
    /// # Errors
    /// `Cache` on store failure or if the value is not an integer.
    pub async fn incr(&self, ctx: &TenantCtx, key: &str) -> Result<i64> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.incr(&key, 1_i64)
            .await
            .map_err(Self::cache_err("incr", key))
    }

    /// # Errors
    /// `Serialization` if the value cannot be encoded, `Cache` on store failure.
    pub async fn hset(
        &self,
        ctx: &TenantCtx,
        key: &str,
        field: &str,
        value: &(impl CacheValue + ?Sized),
    ) -> Result<()> {
        let (mut conn, key) = self.target(ctx, key)?;
        let bytes = Self::encode(&key, value)?;
        conn.hset(&key, field, bytes)
            .await
            .map_err(Self::cache_err("hset", key))
    }

    /// # Errors
    /// `Cache` on store failure.
    pub async fn hget(&self, ctx: &TenantCtx, key: &str, field: &str) -> Result<Option<String>> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.hget(&key, field)
            .await
            .map_err(Self::cache_err("hget", key))
    }

    /// # Errors
    /// `Cache` on store failure.
    pub async fn hget_all(&self, ctx: &TenantCtx, key: &str) -> Result<HashMap<String, String>> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.hgetall(&key)
            .await
            .map_err(Self::cache_err("hget_all", key))
    }

    /// Remove `fields` from the hash, returning how many were removed.
    ///
    /// # Errors
    /// `Cache` on store failure.
    pub async fn hdel(&self, ctx: &TenantCtx, key: &str, fields: &[&str]) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.hdel(&key, fields)
            .await
            .map_err(Self::cache_err("hdel", key))
    }

    /// Prepend `values`, returning the new list length.
    ///
    /// # Errors
    /// `Serialization` if a value cannot be encoded, `Cache` on store failure.
    pub async fn lpush<V: CacheValue>(&self, ctx: &TenantCtx, key: &str, values: &[V]) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        let encoded = encode_all(&key, values)?;
        conn.lpush(&key, encoded)
            .await
            .map_err(Self::cache_err("lpush", key))
    }

    /// Append `values`, returning the new list length.
    ///
    /// # Errors
    /// `Serialization` if a value cannot be encoded, `Cache` on store failure.
    pub async fn rpush<V: CacheValue>(&self, ctx: &TenantCtx, key: &str, values: &[V]) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        let encoded = encode_all(&key, values)?;
        conn.rpush(&key, encoded)
            .await
            .map_err(Self::cache_err("rpush", key))
    }

    /// Elements `start..=stop` of the list; negative indexes count from the end.
    ///
    /// # Errors
    /// `Cache` on store failure.
    pub async fn lrange(
        &self,
        ctx: &TenantCtx,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.lrange(&key, start, stop)
            .await
            .map_err(Self::cache_err("lrange", key))
    }

    /// Add `members` to the set, returning how many were new.
    ///
    /// # Errors
    /// `Serialization` if a member cannot be encoded, `Cache` on store failure.
    pub async fn sadd<V: CacheValue>(&self, ctx: &TenantCtx, key: &str, members: &[V]) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        let encoded = encode_all(&key, members)?;
        conn.sadd(&key, encoded)
            .await
            .map_err(Self::cache_err("sadd", key))
    }

    /// # Errors
    /// `Cache` on store failure.
    pub async fn smembers(&self, ctx: &TenantCtx, key: &str) -> Result<Vec<String>> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.smembers(&key)
            .await
            .map_err(Self::cache_err("smembers", key))
    }

    /// # Errors
    /// `Serialization` if a member cannot be encoded, `Cache` on store failure.
    pub async fn srem<V: CacheValue>(&self, ctx: &TenantCtx, key: &str, members: &[V]) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        let encoded = encode_all(&key, members)?;
        conn.srem(&key, encoded)
            .await
            .map_err(Self::cache_err("srem", key))
    }

    /// Add `(score, member)` pairs to the sorted set, returning how many were new.
    ///
    /// # Errors
    /// `Serialization` if a member cannot be encoded, `Cache` on store failure.
    pub async fn zadd<V: CacheValue>(
        &self,
        ctx: &TenantCtx,
        key: &str,
        members: &[(f64, V)],
    ) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        let encoded = members
            .iter()
            .map(|(score, member)| Self::encode(&key, member).map(|m| (*score, m)))
            .collect::<Result<Vec<_>>>()?;
        conn.zadd_multiple(&key, encoded.as_slice())
            .await
            .map_err(Self::cache_err("zadd", key))
    }

    /// Members ranked `start..=stop` by ascending score.
    ///
    /// # Errors
    /// `Cache` on store failure.
    pub async fn zrange(
        &self,
        ctx: &TenantCtx,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        let (mut conn, key) = self.target(ctx, key)?;
        conn.zrange(&key, start, stop)
            .await
            .map_err(Self::cache_err("zrange", key))
    }

    /// # Errors
    /// `Cache` on store failure.
    pub async fn zrange_with_scores(
        &self,
        ctx: &TenantCtx,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<ScoredMember>> {
        let (mut conn, key) = self.target(ctx, key)?;
        let pairs: Vec<(String, f64)> = conn
            .zrange_withscores(&key, start, stop)
            .await
            .map_err(Self::cache_err("zrange_with_scores", key))?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    /// # Errors
    /// `Serialization` if a member cannot be encoded, `Cache` on store failure.
    pub async fn zrem<V: CacheValue>(&self, ctx: &TenantCtx, key: &str, members: &[V]) -> Result<u64> {
        let (mut conn, key) = self.target(ctx, key)?;
        let encoded = encode_all(&key, members)?;
        conn.zrem(&key, encoded)
            .await
            .map_err(Self::cache_err("zrem", key))
    }

    /// Try to acquire the lock `name` for `token`.
    ///
    /// Returns `true` only if this call created the lock key. The key expires
    /// after `ttl`; a zero `ttl` creates a lock that never expires.
    ///
    /// # Errors
    /// `EmptyIdentifier` for an empty name or token, `Cache` on store failure.
    pub async fn lock(&self, ctx: &TenantCtx, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        Self::check_lock_args("lock", name, token)?;
        let (mut conn, key) = self.target(ctx, &format!("{LOCK_PREFIX}{name}"))?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(token).arg("NX");
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(Self::cache_err("lock", key.clone()))?;

        let acquired = reply.is_some();
        tracing::debug!(key = %key, acquired, "Lock attempt");
        Ok(acquired)
    }

    /// Release the lock `name` if it is still held by `token`.
    ///
    /// Compare and delete run as one server-side script. Returns `false`
    /// when the lock is missing or held by another token.
    ///
    /// # Errors
    /// `EmptyIdentifier` for an empty name or token, `Cache` on store failure.
    pub async fn unlock(&self, ctx: &TenantCtx, name: &str, token: &str) -> Result<bool> {
        Self::check_lock_args("unlock", name, token)?;
        let (mut conn, key) = self.target(ctx, &format!("{LOCK_PREFIX}{name}"))?;

        let deleted: i64 = UNLOCK_SCRIPT
            .key(&key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::cache_err("unlock", key.clone()))?;

        tracing::debug!(key = %key, released = deleted == 1, "Unlock attempt");
        Ok(deleted == 1)
    }

    fn check_lock_args(op: &'static str, name: &str, token: &str) -> Result<()> {
        if name.is_empty() {
            return Err(TenantError::EmptyIdentifier { op, what: "lock name" });
        }
        if token.is_empty() {
            return Err(TenantError::EmptyIdentifier { op, what: "lock token" });
        }
        Ok(())
    }
}
