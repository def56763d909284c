//! Durable audit publisher
//!
//! Request handlers hand events to `AuditPublisher::publish`, which only
//! enqueues. A single background task owns the broker producer and sends
//! events in submission order:
//!
//! ```text
//! publish() --try_send--> [bounded queue] --> worker --send+ack--> broker
//! ```
//!
//! A full or closed queue drops the event; a failed send drops the producer
//! so the next event reconnects. Both are logged and counted, and neither is
//! ever visible to the caller.

use crate::config::{BrokerConfig, PublisherConfig, DRAIN_CAPACITY};
use crate::error::{ObserveError, Result};
use crate::provider::{AuditProducer, BrokerConnector};
use crate::telemetry::Telemetry;
use crate::types::AuditEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum Command {
    Publish(AuditEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    sender: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    broker: Arc<dyn BrokerConnector>,
    topic: String,
    viewer_group: String,
    drain_max: usize,
    drain_idle: Duration,
    telemetry: Telemetry,
}

/// Fire-and-forget audit publisher with read-back drains
///
/// Clones share the same queue and worker.
#[derive(Clone)]
pub struct AuditPublisher {
    inner: Arc<Shared>,
}

impl AuditPublisher {
    /// Start the publisher task on the current tokio runtime
    ///
    /// No broker connection is made until the first event arrives.
    pub fn spawn(
        broker: Arc<dyn BrokerConnector>,
        broker_config: &BrokerConfig,
        config: &PublisherConfig,
        telemetry: Telemetry,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        let worker = Worker {
            broker: broker.clone(),
            topic: broker_config.topic.clone(),
            publish_timeout: config.publish_timeout(),
            producer: None,
            telemetry: telemetry.clone(),
        };
        let handle = tokio::spawn(worker.run(receiver));

        tracing::info!(
            broker = broker.name(),
            topic = %broker_config.topic,
            queue_capacity = config.queue_capacity,
            "Audit publisher started"
        );

        Self {
            inner: Arc::new(Shared {
                sender,
                worker: Mutex::new(Some(handle)),
                broker,
                topic: broker_config.topic.clone(),
                viewer_group: broker_config.viewer_group.clone(),
                drain_max: config.drain_max.min(DRAIN_CAPACITY),
                drain_idle: config.drain_idle_timeout(),
                telemetry,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Enqueue an event and return immediately
    pub fn publish(&self, event: AuditEvent) {
        let reason = match self.inner.sender.try_send(Command::Publish(event)) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => "queue full",
            Err(TrySendError::Closed(_)) => "publisher stopped",
        };

        tracing::warn!(topic = %self.inner.topic, reason, "Dropping audit event");
        self.inner.telemetry.sink_error("audit_queue");
    }

    /// Wait until every event enqueued before this call has been handled
    pub async fn flush(&self) -> Result<()> {
        let stopped = || ObserveError::Publish {
            topic: self.inner.topic.clone(),
            reason: "publisher stopped".to_string(),
        };

        let (done, wait) = oneshot::channel();
        self.inner
            .sender
            .send(Command::Flush(done))
            .await
            .map_err(|_| stopped())?;
        wait.await.map_err(|_| stopped())
    }

    /// Stop accepting events, deliver what is queued, and join the worker
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.inner.sender.send(Command::Shutdown(done)).await.is_ok() {
            let _ = wait.await;
        }

        let handle = self.inner.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Audit publisher task ended abnormally");
            }
        }
    }

    /// Read back up to `max_count` events from `topic`, newest first
    ///
    /// Every call reads from the earliest retained event under a fresh
    /// consumer identity, so repeated drains may return the same events.
    /// Reading stops at `max_count` (capped at 100) or after `idle_timeout`
    /// passes without a new event. Payloads that are not audit events are
    /// skipped but still count toward a read budget of twice `max_count`,
    /// so a topic full of garbage cannot stretch one drain.
    pub async fn drain(
        &self,
        topic: &str,
        max_count: usize,
        idle_timeout: Duration,
    ) -> Result<Vec<AuditEvent>> {
        let max_count = max_count.min(DRAIN_CAPACITY);
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let identity = format!("{}-{}", self.inner.viewer_group, uuid::Uuid::new_v4());
        let mut consumer = self.inner.broker.consumer(topic, &identity).await?;

        let read_budget = max_count.saturating_mul(2);
        let mut events = Vec::with_capacity(max_count);
        let mut skipped = 0usize;
        while events.len() < max_count && events.len() + skipped < read_budget {
            let Some(payload) = consumer.next(idle_timeout).await? else {
                break;
            };
            match serde_json::from_slice::<AuditEvent>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(topic, error = %e, "Skipping malformed audit payload");
                }
            }
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        tracing::debug!(
            topic,
            consumer = %identity,
            count = events.len(),
            skipped,
            "Drained audit events"
        );

        Ok(events)
    }

    /// Drain the configured topic with the configured limits
    pub async fn drain_recent(&self) -> Result<Vec<AuditEvent>> {
        self.drain(&self.inner.topic, self.inner.drain_max, self.inner.drain_idle)
            .await
    }
}

struct Worker {
    broker: Arc<dyn BrokerConnector>,
    topic: String,
    publish_timeout: Duration,
    producer: Option<Box<dyn AuditProducer>>,
    telemetry: Telemetry,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        let mut stop_waiters = Vec::new();

        while let Some(command) = receiver.recv().await {
            match command {
                Command::Publish(event) => self.deliver(event).await,
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown(done) => {
                    // Buffered commands are still received after close
                    receiver.close();
                    stop_waiters.push(done);
                }
            }
        }

        tracing::info!(topic = %self.topic, "Audit publisher stopped");
        for done in stop_waiters {
            let _ = done.send(());
        }
    }

    async fn deliver(&mut self, event: AuditEvent) {
        let result = tokio::time::timeout(self.publish_timeout, self.send(&event))
            .await
            .unwrap_or_else(|_| {
                Err(ObserveError::Timeout(format!(
                    "publish to '{}' exceeded {}ms",
                    self.topic,
                    self.publish_timeout.as_millis()
                )))
            });

        if let Err(e) = result {
            tracing::warn!(
                topic = %self.topic,
                endpoint = %event.endpoint,
                error = %e,
                "Failed to publish audit event"
            );
            self.telemetry.sink_error("audit_publisher");
            self.producer = None;
        }
    }

    async fn send(&mut self, event: &AuditEvent) -> Result<u64> {
        let payload = serde_json::to_vec(event)?;

        let producer = match self.producer.take() {
            Some(producer) => producer,
            None => self.broker.producer().await?,
        };
        let producer = self.producer.insert(producer);

        let sequence = producer.send(&self.topic, payload).await?;
        tracing::trace!(topic = %self.topic, sequence, "Audit event acknowledged");
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryBroker;
    use crate::telemetry::{MemorySpanExporter, SINK_ERRORS};
    use crate::types::Outcome;

    const TOPIC: &str = "api-logs";

    fn publisher_with(broker: &MemoryBroker, capacity: usize) -> (AuditPublisher, Telemetry) {
        let telemetry = Telemetry::new("test", Arc::new(MemorySpanExporter::new()));
        let config = PublisherConfig {
            queue_capacity: capacity,
            ..Default::default()
        };
        let publisher = AuditPublisher::spawn(
            Arc::new(broker.clone()),
            &BrokerConfig::default(),
            &config,
            telemetry.clone(),
        );
        (publisher, telemetry)
    }

    fn event(endpoint: &str) -> AuditEvent {
        AuditEvent::new(endpoint, "GET", Outcome::Success, Some("alice".into()))
    }

    fn sink_errors(telemetry: &Telemetry, sink: &str) -> u64 {
        telemetry.counter_value(SINK_ERRORS, &[("sink", sink)])
    }

    #[tokio::test]
    async fn test_publish_preserves_submission_order() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher_with(&broker, 16);

        for i in 0..5 {
            publisher.publish(event(&format!("/e/{}", i)));
        }
        publisher.flush().await.unwrap();

        let endpoints: Vec<String> = broker.events(TOPIC).into_iter().map(|e| e.endpoint).collect();
        assert_eq!(endpoints, vec!["/e/0", "/e/1", "/e/2", "/e/3", "/e/4"]);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_broker_down_is_swallowed_and_reconnects() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (publisher, telemetry) = publisher_with(&broker, 16);

        publisher.publish(event("/a"));
        publisher.publish(event("/b"));
        publisher.flush().await.unwrap();

        assert!(broker.payloads(TOPIC).is_empty());
        assert_eq!(sink_errors(&telemetry, "audit_publisher"), 2);
        assert_eq!(broker.connect_count(), 2);

        broker.set_available(true);
        publisher.publish(event("/c"));
        publisher.flush().await.unwrap();
        assert_eq!(broker.events(TOPIC)[0].endpoint, "/c");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let broker = MemoryBroker::new();
        let (publisher, telemetry) = publisher_with(&broker, 1);

        // The worker cannot run until this task yields
        publisher.publish(event("/kept"));
        publisher.publish(event("/dropped-1"));
        publisher.publish(event("/dropped-2"));

        assert_eq!(sink_errors(&telemetry, "audit_queue"), 2);
        publisher.flush().await.unwrap();
        assert_eq!(broker.events(TOPIC).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_broker_times_out_and_drops_producer() {
        let broker = MemoryBroker::new();
        broker.set_latency(Duration::from_secs(20));
        let (publisher, telemetry) = publisher_with(&broker, 16);

        publisher.publish(event("/slow"));
        publisher.flush().await.unwrap();
        assert_eq!(sink_errors(&telemetry, "audit_publisher"), 1);

        broker.set_latency(Duration::ZERO);
        publisher.publish(event("/fast"));
        publisher.flush().await.unwrap();
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.events(TOPIC).last().unwrap().endpoint, "/fast");
    }

    #[tokio::test]
    async fn test_shutdown_delivers_queued_events() {
        let broker = MemoryBroker::new();
        let (publisher, telemetry) = publisher_with(&broker, 16);

        publisher.publish(event("/1"));
        publisher.publish(event("/2"));
        publisher.shutdown().await;
        assert_eq!(broker.events(TOPIC).len(), 2);

        publisher.publish(event("/late"));
        assert_eq!(sink_errors(&telemetry, "audit_queue"), 1);
        assert!(publisher.flush().await.is_err());
        // second shutdown is a no-op
        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_sorts_newest_first_and_skips_malformed() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher_with(&broker, 16);
        let now = chrono::Utc::now();

        for (endpoint, age) in [("/old", 30), ("/new", 1), ("/mid", 10)] {
            let mut e = event(endpoint);
            e.timestamp = now - chrono::Duration::seconds(age);
            broker.inject(TOPIC, serde_json::to_vec(&e).unwrap());
        }
        broker.inject(TOPIC, b"garbage".to_vec());

        let drained = publisher
            .drain(TOPIC, 100, Duration::from_secs(5))
            .await
            .unwrap();
        let endpoints: Vec<&str> = drained.iter().map(|e| e.endpoint.as_str()).collect();
        assert_eq!(endpoints, vec!["/new", "/mid", "/old"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_malformed_payloads_spend_read_budget() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher_with(&broker, 16);
        for _ in 0..500 {
            broker.inject(TOPIC, b"garbage".to_vec());
        }
        broker.inject(TOPIC, serde_json::to_vec(&event("/late")).unwrap());

        let start = tokio::time::Instant::now();
        let drained = publisher
            .drain(TOPIC, 10, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(drained.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_caps_count_and_uses_fresh_identity() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher_with(&broker, 16);
        for i in 0..150 {
            broker.inject(TOPIC, serde_json::to_vec(&event(&format!("/{}", i))).unwrap());
        }

        let first = publisher.drain(TOPIC, 500, Duration::from_secs(5)).await.unwrap();
        let second = publisher.drain(TOPIC, 3, Duration::from_secs(5)).await.unwrap();

        assert_eq!(first.len(), 100);
        assert_eq!(second.len(), 3);
        let ids = broker.consumer_identities();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| id.starts_with("api-logs-viewer-")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_empty_topic_waits_idle_timeout() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher_with(&broker, 16);

        let start = tokio::time::Instant::now();
        let drained = publisher.drain_recent().await.unwrap();

        assert!(drained.is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_drain_broker_down_errors() {
        let broker = MemoryBroker::new();
        let (publisher, _) = publisher_with(&broker, 16);
        broker.set_available(false);

        assert!(publisher.drain(TOPIC, 10, Duration::from_millis(10)).await.is_err());
        assert!(publisher.drain(TOPIC, 0, Duration::from_millis(10)).await.unwrap().is_empty());
    }
}
