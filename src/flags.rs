//! Short-lived key/value state kept in Redis.
//!
//! Everything stored here is advisory: cancellation hints and guest usage
//! counters. Callers decide how to degrade when the store is unreachable.

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct RedisFlags {
    conn: ConnectionManager,
}

impl RedisFlags {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisFlags { conn })
    }
}

#[async_trait]
impl EphemeralStore for RedisFlags {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Stand-in used when Redis could not be reached at start-up. Every call
/// fails, so consumers take their fail-open paths.
#[derive(Debug, Clone, Default)]
pub struct OfflineFlags;

#[async_trait]
impl EphemeralStore for OfflineFlags {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Err(anyhow!("flag store offline, cannot read {key}"))
    }

    async fn set(&self, key: &str, _value: &str, _ttl: Duration) -> Result<(), Error> {
        Err(anyhow!("flag store offline, cannot write {key}"))
    }
}

/// Connects to Redis, falling back to [`OfflineFlags`].
pub async fn connect_or_offline(url: &str) -> std::sync::Arc<dyn EphemeralStore> {
    match RedisFlags::connect(url).await {
        Ok(flags) => std::sync::Arc::new(flags),
        Err(err) => {
            warn!(error = %err, "Flag store unreachable, cancellation and guest limits fail open");
            std::sync::Arc::new(OfflineFlags)
        }
    }
}
