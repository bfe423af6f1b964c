use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisError, Script};
use std::time::Duration;

use super::{CredentialStore, HitOutcome, HitRequest, StoreError};

/// Prune strictly-older entries, count, then either append `cost` entries or
/// set the block marker. Returns {allowed, count, oldest_score, blocked_until}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local window_key = KEYS[1]
local block_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local cooldown = tonumber(ARGV[5])
local member = ARGV[6]

redis.call('ZREMRANGEBYSCORE', window_key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', window_key)
local blocked_until = tonumber(redis.call('GET', block_key) or '0')
local allowed = 0

if blocked_until <= now then
  blocked_until = 0
  if count + cost <= max then
    for i = 1, cost do
      redis.call('ZADD', window_key, now, member .. ':' .. i)
    end
    redis.call('PEXPIRE', window_key, window)
    count = count + cost
    allowed = 1
  else
    blocked_until = now + cooldown
    if cooldown > 0 then
      redis.call('SET', block_key, blocked_until, 'PX', cooldown)
    end
  end
end

local oldest = redis.call('ZRANGE', window_key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end

return {allowed, count, oldest_score, blocked_until}
"#;

#[derive(Clone)]
pub struct RedisStore {
    _client: Client,
    manager: ConnectionManager,
    window_script: Script,
}

fn store_error(op: &str, e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Connection(format!("{}: {}", op, e))
    } else {
        StoreError::Command(format!("{}: {}", op, e))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects on its own after drops
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl CredentialStore for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET", e))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("GET", e))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("GETDEL", e))
    }

    async fn exists_any(&self, keys: &[String]) -> Result<bool, StoreError> {
        if keys.is_empty() {
            return Ok(false);
        }
        let mut conn = self.manager.clone();
        let found: u64 = redis::cmd("EXISTS")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("EXISTS", e))?;
        Ok(found > 0)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("DEL", e))?;
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SADD", e))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SISMEMBER", e))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: u64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SREM", e))?;
        Ok(removed > 0)
    }

    async fn set_move(&self, from: &str, to: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SMOVE")
            .arg(from)
            .arg(to)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SMOVE", e))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SMEMBERS", e))
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SCARD", e))
    }

    async fn record_hit(
        &self,
        window_key: &str,
        block_key: &str,
        hit: &HitRequest,
    ) -> Result<HitOutcome, StoreError> {
        let mut conn = self.manager.clone();
        let (allowed, count, oldest, blocked_until): (i64, i64, i64, i64) = self
            .window_script
            .key(window_key)
            .key(block_key)
            .arg(hit.now_ms)
            .arg(hit.window_ms)
            .arg(hit.max_count)
            .arg(hit.cost)
            .arg(hit.cooldown_ms)
            .arg(&hit.member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("EVALSHA sliding_window", e))?;

        Ok(HitOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            oldest_ms: (oldest >= 0).then_some(oldest),
            blocked_until_ms: (blocked_until > 0).then_some(blocked_until),
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| store_error("PING", e))
    }
}
