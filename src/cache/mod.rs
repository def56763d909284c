//! Fast key-value cache access
//!
//! `CacheBackend` dials a single connection; `ResilientConnector` wraps a
//! backend with the bounded retry-and-ping policy every caller goes through.
//! Connections are per-operation and released when dropped.

use crate::config::CacheConfig;
use crate::error::{ObserveError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisBackend;

/// A live connection to the cache
///
/// List operations follow Redis semantics: index 0 is the head and negative
/// indexes count from the tail.
#[async_trait]
pub trait CacheConnection: Send {
    /// Liveness check
    async fn ping(&mut self) -> Result<()>;

    /// Push a value onto the head of a list
    async fn push_front(&mut self, key: &str, value: &str) -> Result<()>;

    /// Keep only the elements in `start..=stop`
    async fn trim(&mut self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// Read the elements in `start..=stop`
    async fn range(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Number of elements in a list
    async fn list_len(&mut self, key: &str) -> Result<usize>;

    /// Set a string value that expires after `ttl`
    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read a string value
    async fn get(&mut self, key: &str) -> Result<Option<String>>;

    /// Delete a key
    async fn delete(&mut self, key: &str) -> Result<()>;
}

/// Something that can open cache connections
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Open one connection, without retries
    async fn dial(&self) -> Result<Box<dyn CacheConnection>>;

    /// Backend name for logs (e.g., "redis", "memory")
    fn name(&self) -> &str;
}

/// Connects to the cache with a bounded, fixed-delay retry policy
///
/// Each attempt dials and then pings; only a connection that answered the
/// ping is handed out. Worst-case latency is
/// `max_attempts * connect_time + (max_attempts - 1) * retry_delay`.
#[derive(Clone)]
pub struct ResilientConnector {
    backend: Arc<dyn CacheBackend>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ResilientConnector {
    pub fn new(backend: Arc<dyn CacheBackend>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self::new(backend, config.max_attempts, config.retry_delay())
    }

    /// Open a verified connection, or `ObserveError::Connection` once every
    /// attempt has failed
    pub async fn connect(&self) -> Result<Box<dyn CacheConnection>> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.attempt().await {
                Ok(conn) => {
                    if attempt > 1 {
                        tracing::info!(
                            backend = self.backend.name(),
                            attempt,
                            "Cache connection recovered"
                        );
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    if attempt < self.max_attempts {
                        tracing::warn!(
                            backend = self.backend.name(),
                            attempt,
                            max_attempts = self.max_attempts,
                            retry_in_ms = self.retry_delay.as_millis() as u64,
                            error = %e,
                            "Cache connection attempt failed, retrying"
                        );
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());

        tracing::error!(
            backend = self.backend.name(),
            attempts = self.max_attempts,
            error = %reason,
            "Cache connection failed"
        );

        Err(ObserveError::Connection(format!(
            "{} unreachable after {} attempts: {}",
            self.backend.name(),
            self.max_attempts,
            reason
        )))
    }

    async fn attempt(&self) -> Result<Box<dyn CacheConnection>> {
        let mut conn = self.backend.dial().await?;
        conn.ping().await?;
        Ok(conn)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}
