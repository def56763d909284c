//! Broker abstraction for the durable audit topic
//!
//! Audit backends (NATS JetStream, in-memory) implement `BrokerConnector`,
//! which hands out producers for the publisher task and one-shot consumers
//! for inspection drains.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Opens producers and consumers on a broker
///
/// Connectors carry no retry policy of their own. Callers decide what a
/// failure means: the publisher drops its producer and reconnects on the
/// next event, a drain surfaces the error.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a producer for the audit topic
    async fn producer(&self) -> Result<Box<dyn AuditProducer>>;

    /// Open a consumer positioned at the earliest retained message
    ///
    /// `identity` names the consumer; each call should pass a fresh one so
    /// concurrent drains never share read progress.
    async fn consumer(&self, topic: &str, identity: &str) -> Result<Box<dyn AuditConsumer>>;

    /// Broker name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// Producer handle, owned by a single task
#[async_trait]
pub trait AuditProducer: Send {
    /// Send one payload and wait for the broker acknowledgement
    ///
    /// Returns the broker-assigned sequence number.
    async fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<u64>;
}

/// Consumer handle for a single drain
#[async_trait]
pub trait AuditConsumer: Send {
    /// Next raw payload, or `None` once `idle` passes with nothing new
    async fn next(&mut self, idle: Duration) -> Result<Option<Vec<u8>>>;
}
