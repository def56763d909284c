//! # a3s-audit
//!
//! Request audit trail, recent-activity cache, and telemetry for A3S backends.
//!
//! ## Overview
//!
//! Every business operation ends in exactly one [`Report`]. The
//! [`RequestAuditFacade`] fans it out to four independent sinks:
//!
//! - **counters**: `api.calls{endpoint, method, status}` via the `metrics` facade
//! - **spans**: error flag and message on the current span
//! - **recent activity**: a capped, newest-first list in Redis
//! - **audit topic**: a durable NATS JetStream subject, published off the
//!   request path
//!
//! None of the sinks can fail or noticeably slow down the handler that
//! reports to them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_audit::{AuditConfig, AuditStack, Report};
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let stack = AuditStack::from_config(&AuditConfig::from_env())?;
//!
//! stack
//!     .facade()
//!     .report(Report::success("/db/messages", "GET").actor(Some("alice")))
//!     .await;
//!
//! stack.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **redis** / **memory**: recent-activity cache and session records
//! - **nats** / **memory**: durable audit topic
//! - **otlp** / **log** / **memory**: span export
//!
//! ## Architecture
//!
//! - **ResilientConnector**: bounded retry-and-ping cache connections
//! - **RecentActivityLog**: capped newest-first activity list
//! - **AuditPublisher**: channel-fed background publisher plus read-back drains
//! - **Telemetry**: spans, counters, subscriber and exporter setup
//! - **OtlpSpanExporter**: batched OTLP/HTTP span export to a collector
//! - **Backend**: audited message board handlers built on the above

pub mod activity;
pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod otlp;
pub mod provider;
pub mod publisher;
pub mod service;
pub mod session;
pub mod stack;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export core types
pub use activity::RecentActivityLog;
pub use cache::{CacheBackend, CacheConnection, ResilientConnector};
pub use config::{
    AuditConfig, BrokerConfig, CacheConfig, PublisherConfig, TelemetryConfig, DRAIN_CAPACITY,
    RECENT_CAPACITY,
};
pub use error::{ApiError, ObserveError, Result, StoreError};
pub use facade::{Report, RequestAuditFacade};
pub use provider::{AuditConsumer, AuditProducer, BrokerConnector};
pub use publisher::AuditPublisher;
pub use service::{ApiResult, Backend, Credentials, NewMessage, PasswordHasher};
pub use session::{require_login, MemorySession, RequestSession, SessionRecord, SessionRegistry};
pub use stack::AuditStack;
pub use store::{MemoryRecordStore, RecordStore, Row};
pub use otlp::OtlpSpanExporter;
pub use telemetry::{LogSpanExporter, MemorySpanExporter, SpanExporter, SpanRecord, Telemetry};
pub use types::{AuditEvent, LogEntry, Outcome, RecentEntry};

// Re-export backends for convenience
pub use cache::{MemoryCache, RedisBackend};
pub use provider::memory::MemoryBroker;
pub use provider::nats::{NatsBroker, NatsClient};
