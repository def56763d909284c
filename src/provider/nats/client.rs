//! NATS JetStream client: connect, publish, read back

use crate::config::BrokerConfig;
use crate::error::{ObserveError, Result};
use async_nats::jetstream;
use bytes::Bytes;
use futures::StreamExt;
use std::pin::Pin;
use std::time::Duration;

/// NATS JetStream client
///
/// Owns one connection and the handle of the stream backing the audit
/// topic. The stream is created on first connect if it does not exist.
pub struct NatsClient {
    /// JetStream context, keeps the connection alive
    jetstream: jetstream::Context,

    /// Stream bound to the audit topic
    stream: jetstream::stream::Stream,
}

impl NatsClient {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connect_opts = build_connect_options(config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| ObserveError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client);
        let stream = ensure_stream(&jetstream, config).await?;

        Ok(Self { jetstream, stream })
    }

    /// Publish a payload, returning the JetStream sequence number
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<u64> {
        let ack = self
            .jetstream
            .publish(topic.to_string(), Bytes::from(payload))
            .await
            .map_err(|e| ObserveError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| ObserveError::Publish {
                topic: topic.to_string(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(topic, sequence = ack.sequence, "Audit event published");

        Ok(ack.sequence)
    }

    /// Create an ephemeral consumer that replays the topic from the start
    ///
    /// The consumer does not ack, so reading never moves anything for other
    /// readers; the server removes it once it has been inactive for a while.
    pub async fn replay(&self, topic: &str, identity: &str) -> Result<NatsReplay> {
        let consumer = self
            .stream
            .create_consumer(jetstream::consumer::pull::Config {
                name: Some(identity.to_string()),
                filter_subject: topic.to_string(),
                deliver_policy: jetstream::consumer::DeliverPolicy::All,
                ack_policy: jetstream::consumer::AckPolicy::None,
                inactive_threshold: Duration::from_secs(30),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                ObserveError::Consumer(format!(
                    "Failed to create replay consumer '{}': {}",
                    identity, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            ObserveError::Consumer(format!("Failed to open message stream on '{}': {}", topic, e))
        })?;

        tracing::debug!(consumer = identity, topic, "Replay consumer created");

        Ok(NatsReplay {
            messages: Box::pin(messages),
        })
    }
}

/// Pull-based message stream of a replay consumer
pub struct NatsReplay {
    messages: Pin<Box<jetstream::consumer::pull::Stream>>,
}

impl NatsReplay {
    /// Next payload, or `None` after `idle` with no message
    pub async fn next_payload(&mut self, idle: Duration) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(idle, self.messages.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Ok(None),
            Ok(Some(Ok(msg))) => Ok(Some(msg.payload.to_vec())),
            Ok(Some(Err(e))) => Err(ObserveError::Consumer(format!(
                "Failed to read replay message: {}",
                e
            ))),
        }
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &BrokerConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &BrokerConfig,
) -> Result<jetstream::stream::Stream> {
    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: vec![config.topic.clone()],
        storage: jetstream::stream::StorageType::File,
        max_messages: config.max_events,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(stream_config).await.map_err(|e| {
        ObserveError::Stream(format!(
            "Failed to create/get stream '{}': {}",
            config.stream_name, e
        ))
    })?;

    tracing::info!(
        stream = %config.stream_name,
        topic = %config.topic,
        "JetStream stream ready"
    );

    Ok(stream)
}
