//! Core record types for the audit subsystem
//!
//! Every record is write-once: built at the moment it is emitted and never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry in the recent-activity cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Time the entry was written
    pub timestamp: DateTime<Utc>,

    /// Short operation tag (e.g., "db_insert", "db_insert_error")
    pub action: String,

    /// Free-form details, already truncated by the caller
    pub details: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time
    pub fn new(action: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            details: details.into(),
        }
    }
}

/// An entry read back from the recent-activity cache
///
/// Stored values that no longer parse as a `LogEntry` are passed through
/// verbatim instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecentEntry {
    /// A well-formed log entry
    Entry(LogEntry),
    /// A stored value that failed to deserialize
    Raw { raw: String },
}

impl RecentEntry {
    /// Parse a stored value, falling back to the raw passthrough
    pub fn parse(stored: String) -> Self {
        match serde_json::from_str::<LogEntry>(&stored) {
            Ok(entry) => RecentEntry::Entry(entry),
            Err(_) => RecentEntry::Raw { raw: stored },
        }
    }

    /// The parsed entry, if this value was well-formed
    pub fn entry(&self) -> Option<&LogEntry> {
        match self {
            RecentEntry::Entry(entry) => Some(entry),
            RecentEntry::Raw { .. } => None,
        }
    }

    /// Whether this value is a raw passthrough
    pub fn is_raw(&self) -> bool {
        matches!(self, RecentEntry::Raw { .. })
    }
}

/// Terminal outcome of a business operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    /// Label value used in counters and audit payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable audit record published to the broker topic
///
/// `actor_id` is always serialized, as `null` for unauthenticated requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Time the event was created
    pub timestamp: DateTime<Utc>,

    /// Logical operation name (e.g., "/db/message")
    pub endpoint: String,

    /// HTTP verb or logical command
    pub method: String,

    /// Outcome of the operation
    pub status: Outcome,

    /// Authenticated actor, if any
    pub actor_id: Option<String>,

    /// Human-readable summary
    pub message: String,
}

impl AuditEvent {
    /// Create an event with the default summary message
    pub fn new(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status: Outcome,
        actor_id: Option<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        let method = method.into();
        let message = format!(
            "{} called {} {} ({})",
            actor_id.as_deref().unwrap_or("anonymous"),
            method,
            endpoint,
            status
        );
        Self {
            timestamp: Utc::now(),
            endpoint,
            method,
            status,
            actor_id,
            message,
        }
    }

    /// Replace the summary message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
