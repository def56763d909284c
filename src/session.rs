//! Login sessions
//!
//! Two layers: the per-request session carried by the web framework
//! (`RequestSession`), and the shared session record kept in the cache
//! under `session:<actor>` so other services can see who is logged in.

use crate::cache::ResilientConnector;
use crate::error::{ApiError, Result};
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Request-session key holding the authenticated actor
pub const USER_ID_KEY: &str = "user_id";

/// Shared session record stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub actor_id: String,
    pub login_time: DateTime<Utc>,
}

/// Cache key for an actor's session record
pub fn session_key(actor_id: &str) -> String {
    format!("session:{}", actor_id)
}

/// Writes and removes shared session records
///
/// `open` and `close` never fail: a cache outage must not block a login
/// or logout, so failures are logged as warnings and counted.
#[derive(Clone)]
pub struct SessionRegistry {
    connector: ResilientConnector,
    ttl: Duration,
    telemetry: Telemetry,
}

impl SessionRegistry {
    pub fn new(connector: ResilientConnector, ttl: Duration, telemetry: Telemetry) -> Self {
        Self {
            connector,
            ttl,
            telemetry,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn open(&self, actor_id: &str) {
        if let Err(e) = self.try_open(actor_id).await {
            tracing::warn!(actor = actor_id, error = %e, "Failed to store session");
            self.telemetry.sink_error("session");
        }
    }

    pub async fn try_open(&self, actor_id: &str) -> Result<()> {
        let record = SessionRecord {
            actor_id: actor_id.to_string(),
            login_time: Utc::now(),
        };
        let value = serde_json::to_string(&record)?;

        let mut conn = self.connector.connect().await?;
        conn.set_with_expiry(&session_key(actor_id), &value, self.ttl)
            .await
    }

    pub async fn close(&self, actor_id: &str) {
        if let Err(e) = self.try_close(actor_id).await {
            tracing::warn!(actor = actor_id, error = %e, "Failed to remove session");
            self.telemetry.sink_error("session");
        }
    }

    pub async fn try_close(&self, actor_id: &str) -> Result<()> {
        let mut conn = self.connector.connect().await?;
        conn.delete(&session_key(actor_id)).await
    }

    /// The live session record for an actor, if any
    pub async fn lookup(&self, actor_id: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.connector.connect().await?;
        let Some(value) = conn.get(&session_key(actor_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&value)?))
    }
}

/// Key-value session scoped to the current request
pub trait RequestSession: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str) -> Option<String>;
    fn clear(&self);
}

/// In-process request session
#[derive(Debug, Default)]
pub struct MemorySession {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session that already carries an authenticated actor
    pub fn logged_in(actor_id: &str) -> Self {
        let session = Self::new();
        session.set(USER_ID_KEY, actor_id.to_string());
        session
    }
}

impl RequestSession for MemorySession {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.remove(key)
    }

    fn clear(&self) {
        if let Ok(mut values) = self.values.lock() {
            values.clear();
        }
    }
}

/// The authenticated actor, or `Unauthorized`
pub fn require_login(session: &dyn RequestSession) -> std::result::Result<String, ApiError> {
    session
        .get(USER_ID_KEY)
        .ok_or_else(|| ApiError::Unauthorized("Login required".to_string()))
}
