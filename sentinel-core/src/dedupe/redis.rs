use super::DedupeStore;
use crate::error::Result;
use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

/// Redis-backed dedupe store using `SET key 1 NX PX <ttl>`.
#[derive(Clone)]
pub struct RedisDedupeStore {
    conn: ConnectionManager,
}

impl RedisDedupeStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting dedupe store to Redis");
        let client = ::redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DedupeStore for RedisDedupeStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        // Nil reply when the key already exists.
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }
}
