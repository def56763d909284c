//! Redis cache backend

use super::{CacheBackend, CacheConnection};
use crate::config::CacheConfig;
use crate::error::{ObserveError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, IntoConnectionInfo};
use std::time::Duration;

/// Dials multiplexed tokio connections to a Redis server
pub struct RedisBackend {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisBackend {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| ObserveError::Config(format!("invalid redis url: {}", e)))?;
        if let Some(ref password) = config.password {
            info.redis.password = Some(password.clone());
        }

        let client = redis::Client::open(info)
            .map_err(|e| ObserveError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connect_timeout: config.connect_timeout(),
        })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn dial(&self) -> Result<Box<dyn CacheConnection>> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            ObserveError::Timeout(format!(
                "redis connect exceeded {}s",
                self.connect_timeout.as_secs()
            ))
        })?
        .map_err(cache_err)?;

        Ok(Box::new(RedisConnection { conn }))
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// One Redis connection, released on drop
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl CacheConnection for RedisConnection {
    async fn ping(&mut self) -> Result<()> {
        let pong: String = redis::cmd("PING")
            .query_async(&mut self.conn)
            .await
            .map_err(cache_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(ObserveError::Cache(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn push_front(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .lpush::<_, _, ()>(key, value)
            .await
            .map_err(cache_err)
    }

    async fn trim(&mut self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.conn
            .ltrim::<_, ()>(key, start, stop)
            .await
            .map_err(cache_err)
    }

    async fn range(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.conn
            .lrange::<_, Vec<String>>(key, start, stop)
            .await
            .map_err(cache_err)
    }

    async fn list_len(&mut self, key: &str) -> Result<usize> {
        self.conn.llen::<_, usize>(key).await.map_err(cache_err)
    }

    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.conn
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(cache_err)
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.conn
            .get::<_, Option<String>>(key)
            .await
            .map_err(cache_err)
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        self.conn.del::<_, ()>(key).await.map_err(cache_err)
    }
}

fn cache_err(e: redis::RedisError) -> ObserveError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        ObserveError::Connection(e.to_string())
    } else {
        ObserveError::Cache(e.to_string())
    }
}
