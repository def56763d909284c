//! In-memory broker for testing and single-process use
//!
//! Topics are append-only vectors shared by every clone. The broker can be
//! switched unavailable or slowed down to exercise the publisher's failure
//! paths.

use super::{AuditConsumer, AuditProducer, BrokerConnector};
use crate::error::{ObserveError, Result};
use crate::types::AuditEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct Inner {
    topics: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    identities: Mutex<Vec<String>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    connects: AtomicU32,
}

/// Shared in-memory broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                identities: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                connects: AtomicU32::new(0),
            }),
        }
    }

    /// Simulate the broker going down or coming back
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied to every send before it is acknowledged
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of producers opened so far
    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Consumer identities seen so far, in creation order
    pub fn consumer_identities(&self) -> Vec<String> {
        self.inner
            .identities
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Raw payloads on a topic, oldest first
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .topics
            .lock()
            .ok()
            .and_then(|topics| topics.get(topic).cloned())
            .unwrap_or_default()
    }

    /// Payloads on a topic that parse as audit events, oldest first
    pub fn events(&self, topic: &str) -> Vec<AuditEvent> {
        self.payloads(topic)
            .iter()
            .filter_map(|payload| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Append a payload directly, bypassing producers
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        if let Ok(mut topics) = self.inner.topics.lock() {
            topics.entry(topic.to_string()).or_default().push(payload);
        }
    }

    fn check(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ObserveError::Connection("memory broker unavailable".to_string()))
        }
    }

    fn topics(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>>> {
        self.inner
            .topics
            .lock()
            .map_err(|e| ObserveError::Stream(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn producer(&self) -> Result<Box<dyn AuditProducer>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
        }))
    }

    async fn consumer(&self, topic: &str, identity: &str) -> Result<Box<dyn AuditConsumer>> {
        self.check()?;
        if let Ok(mut ids) = self.inner.identities.lock() {
            ids.push(identity.to_string());
        }
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            cursor: 0,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Producer onto a `MemoryBroker`
pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl AuditProducer for MemoryProducer {
    async fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<u64> {
        let latency = self.broker.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.broker.check().map_err(|e| ObserveError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let mut topics = self.broker.topics()?;
        let messages = topics.entry(topic.to_string()).or_default();
        messages.push(payload);
        Ok(messages.len() as u64)
    }
}

/// Consumer reading a `MemoryBroker` topic from the beginning
pub struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    cursor: usize,
}

impl MemoryConsumer {
    fn take_next(&mut self) -> Result<Option<Vec<u8>>> {
        self.broker.check()?;
        let topics = self.broker.topics()?;
        let next = topics
            .get(&self.topic)
            .and_then(|messages| messages.get(self.cursor))
            .cloned();
        if next.is_some() {
            self.cursor += 1;
        }
        Ok(next)
    }
}

#[async_trait]
impl AuditConsumer for MemoryConsumer {
    async fn next(&mut self, idle: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(payload) = self.take_next()? {
            return Ok(Some(payload));
        }
        tokio::time::sleep(idle).await;
        self.take_next()
    }
}
