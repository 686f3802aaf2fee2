//! Redis-backed slot store
//!
//! Slots of a provider live in one sorted set: member = holder id, score = lease
//! expiry in milliseconds of Redis server time. Every operation is a Lua script, so
//! purge, count and insert happen atomically on the server and clocks of the worker
//! hosts never matter.

use super::SlotStore;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use ::redis::aio::ConnectionManager;
use ::redis::Script;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ACQUIRE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
local expires = now + tonumber(ARGV[3])
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], expires, ARGV[1])
  return 1
end
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[2]) then
  redis.call('ZADD', KEYS[1], expires, ARGV[1])
  return 1
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], 'XX', now + tonumber(ARGV[2]), ARGV[1])
  return 1
end
return 0
"#;

const HELD_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
return redis.call('ZCARD', KEYS[1])
"#;

/// Slot store shared by every worker process connected to the same Redis
#[derive(Clone)]
pub struct RedisSlotStore {
    connection: ConnectionManager,
    key_prefix: String,
    acquire: Script,
    renew: Script,
    held: Script,
}

impl std::fmt::Debug for RedisSlotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSlotStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisSlotStore {
    /// Connect and check the server answers
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url())?;
        let mut connection = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Store(format!("connection to {} timed out", config.url())))??;
        let _: String = ::redis::cmd("PING").query_async(&mut connection).await?;

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            acquire: Script::new(ACQUIRE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            held: Script::new(HELD_SCRIPT),
        })
    }

    /// Store key of a provider
    ///
    /// Prefixes are URLs, so they are hashed to keep keys short and free of `:`.
    pub fn slots_key(&self, provider_key: &str) -> String {
        let digest = Sha256::digest(provider_key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{}:slots:{hex}", self.key_prefix)
    }
}

fn lease_millis(lease: Duration) -> u64 {
    lease.as_millis().max(1) as u64
}

#[async_trait]
impl SlotStore for RedisSlotStore {
    async fn try_acquire(&self, key: &str, holder: &str, limit: u32, lease: Duration) -> Result<bool> {
        let mut connection = self.connection.clone();
        let granted: i64 = self
            .acquire
            .key(self.slots_key(key))
            .arg(holder)
            .arg(limit)
            .arg(lease_millis(lease))
            .invoke_async(&mut connection)
            .await?;
        Ok(granted == 1)
    }

    async fn renew(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let mut connection = self.connection.clone();
        let renewed: i64 = self
            .renew
            .key(self.slots_key(key))
            .arg(holder)
            .arg(lease_millis(lease))
            .invoke_async(&mut connection)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = ::redis::cmd("ZREM")
            .arg(self.slots_key(key))
            .arg(holder)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn held(&self, key: &str) -> Result<usize> {
        let mut connection = self.connection.clone();
        let count: i64 = self
            .held
            .key(self.slots_key(key))
            .invoke_async(&mut connection)
            .await?;
        Ok(count.max(0) as usize)
    }
}
