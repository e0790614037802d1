//! Redis-backed store shared by every service instance

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::{debug, info};

use crate::{CasOutcome, KvStore, StoreError};

/// Returns 1 when swapped, 0 on mismatch, -1 when the key is absent
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Returns 1 when deleted, 0 on mismatch, -1 when the key is absent
const CAD_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
        {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    cas: Script,
    cad: Script,
}

impl RedisStore {
    /// Connect to `redis_url`; the connection manager reconnects on its own afterwards
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        info!("Connected to redis store");

        Ok(Self {
            redis,
            cas: Script::new(CAS_SCRIPT),
            cad: Script::new(CAD_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let written: bool = conn.set_nx(key, value).await?;
        debug!(key, written, "SETNX");
        Ok(written)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let result: i64 = self
            .cas
            .key(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        Ok(cas_outcome(result))
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let result: i64 = self
            .cad
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        Ok(cas_outcome(result))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(set, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.srem(set, member).await?;
        Ok(removed > 0)
    }

    async fn set_is_member(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let member: bool = conn.sismember(set, member).await?;
        Ok(member)
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.scard(set).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn cas_outcome(result: i64) -> CasOutcome {
    match result {
        1 => CasOutcome::Swapped,
        -1 => CasOutcome::Missing,
        _ => CasOutcome::Mismatch,
    }
}
