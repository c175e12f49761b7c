//! Redis-backed store shared by every service instance.
//!
//! Plain reads and writes are single commands. The conditional writes and
//! the token bucket update run as Lua scripts so each is one atomic step on
//! the server. Bucket refill reads the Redis server clock (`TIME`) so
//! instances with skewed local clocks still agree on elapsed time.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;

use super::SharedStore;
use crate::error::TollgateResult;
use crate::token_bucket::{BucketSpec, Consumption};

const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
end
return 0
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS[1] bucket hash; ARGV: capacity, refill_tokens, refill_period_ms, cost, idle_ttl_ms.
// Returns {consumed, floor(tokens), wait_ms}.
const TAKE_TOKENS: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_tokens = tonumber(ARGV[2])
local period_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local idle_ttl_ms = tonumber(ARGV[5])

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_refill_ms = tonumber(state[2])
if tokens == nil or last_refill_ms == nil then
  tokens = capacity
  last_refill_ms = now_ms
end

if now_ms > last_refill_ms then
  tokens = math.min(capacity, tokens + (now_ms - last_refill_ms) / period_ms * refill_tokens)
  last_refill_ms = now_ms
end

local consumed = 0
if tokens >= cost then
  tokens = tokens - cost
  consumed = 1
end

local wait_ms = 0
if tokens < cost then
  wait_ms = math.ceil((cost - tokens) / refill_tokens) * period_ms
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill_ms', tostring(last_refill_ms))
redis.call('PEXPIRE', KEYS[1], idle_ttl_ms)

return {consumed, math.floor(tokens), wait_ms}
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key this store touches
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate:".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    compare_and_set: Script,
    delete_if_equals: Script,
    take_tokens: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    pub async fn connect(url: &str) -> TollgateResult<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> TollgateResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        tracing::info!(key_prefix = %config.key_prefix, "Connected to Redis");

        Ok(Self {
            connection,
            config,
            compare_and_set: Script::new(COMPARE_AND_SET),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            take_tokens: Script::new(TAKE_TOKENS),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> TollgateResult<bool> {
        let mut conn = self.connection.clone();
        let replaced: i64 = self
            .compare_and_set
            .key(self.key(key))
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(replaced == 1)
    }

    async fn delete(&self, key: &str) -> TollgateResult<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> TollgateResult<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .delete_if_equals
            .key(self.key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: &BucketSpec,
        cost: u32,
    ) -> TollgateResult<Consumption> {
        let mut conn = self.connection.clone();
        let (consumed, remaining, wait_ms): (i64, i64, i64) = self
            .take_tokens
            .key(self.key(key))
            .arg(spec.capacity)
            .arg(spec.refill_tokens)
            .arg(ttl_millis(spec.refill_period))
            .arg(cost)
            .arg(ttl_millis(spec.idle_ttl()))
            .invoke_async(&mut conn)
            .await?;

        tracing::debug!(bucket = %key, consumed, remaining, wait_ms, "Token bucket updated");

        Ok(Consumption {
            consumed: consumed == 1,
            remaining: remaining.max(0) as u64,
            nanos_to_refill: (wait_ms.max(0) as u64).saturating_mul(1_000_000),
        })
    }

    async fn ping(&self) -> TollgateResult<String> {
        let mut conn = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply)
    }
}
