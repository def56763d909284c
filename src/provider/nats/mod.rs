//! NATS JetStream audit broker
//!
//! Audit events land on a JetStream stream bound to the audit subject, so
//! they outlive the process and can be replayed by inspection drains.

mod client;

pub use client::{NatsClient, NatsReplay};

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::provider::{AuditConsumer, AuditProducer, BrokerConnector};
use async_trait::async_trait;
use std::time::Duration;

/// Dials NATS JetStream on demand
///
/// Construction does no I/O. Each producer or consumer holds its own
/// connection and closes it on drop.
pub struct NatsBroker {
    config: BrokerConfig,
}

impl NatsBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl BrokerConnector for NatsBroker {
    async fn producer(&self) -> Result<Box<dyn AuditProducer>> {
        let client = NatsClient::connect(&self.config).await?;
        Ok(Box::new(NatsProducer { client }))
    }

    async fn consumer(&self, topic: &str, identity: &str) -> Result<Box<dyn AuditConsumer>> {
        let client = NatsClient::connect(&self.config).await?;
        let replay = client.replay(topic, identity).await?;
        Ok(Box::new(NatsConsumer {
            replay,
            _client: client,
        }))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Producer holding one JetStream connection
pub struct NatsProducer {
    client: NatsClient,
}

#[async_trait]
impl AuditProducer for NatsProducer {
    async fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<u64> {
        self.client.publish(topic, payload).await
    }
}

/// Consumer for a single drain; the connection lives as long as it does
pub struct NatsConsumer {
    replay: NatsReplay,
    _client: NatsClient,
}

#[async_trait]
impl AuditConsumer for NatsConsumer {
    async fn next(&mut self, idle: Duration) -> Result<Option<Vec<u8>>> {
        self.replay.next_payload(idle).await
    }
}
