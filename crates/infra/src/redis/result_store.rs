//! Redis-backed result store (SET PX / GET / DEL / PING).

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use conveyor_broker::{ResultStore, StoreError};

use super::LazyConnection;

#[derive(Debug)]
pub struct RedisResultStore {
    conn: LazyConnection,
}

fn unavailable(op: &str, e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("{op} failed: {e}"))
}

impl RedisResultStore {
    /// Validate `url`; the connection itself is opened on first use.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let conn = LazyConnection::open(url).map_err(|e| StoreError::Config(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn conn(&self) -> Result<redis::aio::ConnectionManager, StoreError> {
        self.conn.get().await.map_err(|e| unavailable("connect", e))
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("SET", e))
    }

    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| unavailable("GET", e))
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("DEL", e))?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| unavailable("PING", e))
    }
}
