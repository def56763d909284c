//! Configuration for the audit subsystem
//!
//! Every section has defaults matching the deployed backend, so an empty
//! config is usable. `AuditConfig::from_env` overlays the usual environment
//! variables on top of those defaults.

use crate::error::{ObserveError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Maximum entries held in the recent-activity list
pub const RECENT_CAPACITY: usize = 100;

/// Maximum audit events returned by one drain
pub const DRAIN_CAPACITY: usize = 100;

/// Recent-activity cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection URL
    pub url: String,

    /// Password applied to the connection after the URL is parsed, so it
    /// never needs URL escaping
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Connection attempts before giving up
    pub max_attempts: u32,

    /// Fixed delay between connection attempts, in milliseconds
    pub retry_delay_ms: u64,

    /// Per-attempt connect timeout, in seconds
    pub connect_timeout_secs: u64,

    /// List key holding recent-activity entries
    pub list_key: String,

    /// Session record lifetime, in seconds
    pub session_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://my-redis-master:6379/0".to_string(),
            password: None,
            max_attempts: 3,
            retry_delay_ms: 2_000,
            connect_timeout_secs: 5,
            list_key: "api_logs".to_string(),
            session_ttl_secs: 3_600,
        }
    }
}

impl CacheConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Message broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// NATS server URL
    pub url: String,

    /// Optional auth token (plaintext, unauthenticated by default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream backing the audit topic
    pub stream_name: String,

    /// Audit topic (NATS subject)
    pub topic: String,

    /// Identity prefix for inspection consumers
    pub viewer_group: String,

    /// Connect timeout, in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout, in seconds
    pub request_timeout_secs: u64,

    /// Maximum messages retained in the stream (-1 = unlimited)
    pub max_events: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://my-nats:4222".to_string(),
            token: None,
            stream_name: "API_LOGS".to_string(),
            topic: "api-logs".to_string(),
            viewer_group: "api-logs-viewer".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            max_events: 100_000,
        }
    }
}

/// Background publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Bounded queue between request handlers and the publisher task
    pub queue_capacity: usize,

    /// Per-event publish deadline, in milliseconds
    pub publish_timeout_ms: u64,

    /// Default cap on events returned by a drain
    pub drain_max: usize,

    /// Idle timeout that ends a drain, in milliseconds
    pub drain_idle_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            publish_timeout_ms: 10_000,
            drain_max: 100,
            drain_idle_timeout_ms: 5_000,
        }
    }
}

impl PublisherConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn drain_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_idle_timeout_ms)
    }
}

/// Tracing and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Value of the `service.name` resource tag
    pub service_name: String,

    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub log_filter: String,

    /// Emit JSON log lines instead of the human-readable format
    pub json_logs: bool,

    /// Prometheus listener address; metrics stay in-process when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,

    /// OTLP/HTTP traces endpoint; spans are only logged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,

    /// Extra headers sent with every export request
    #[serde(default, skip_serializing)]
    pub otlp_headers: BTreeMap<String, String>,

    /// Per-request export deadline, in milliseconds
    pub otlp_timeout_ms: u64,

    /// Spans buffered ahead of the exporter before new ones are dropped
    pub otlp_queue_capacity: usize,

    /// Maximum spans per export request
    pub otlp_batch_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tk-backend".to_string(),
            log_filter: "a3s_audit=info".to_string(),
            json_logs: false,
            metrics_addr: None,
            otlp_endpoint: None,
            otlp_headers: BTreeMap::new(),
            otlp_timeout_ms: 10_000,
            otlp_queue_capacity: 2_048,
            otlp_batch_size: 512,
        }
    }
}

impl TelemetryConfig {
    pub fn otlp_timeout(&self) -> Duration {
        Duration::from_millis(self.otlp_timeout_ms)
    }
}

/// Parse `key=value,key2=value2` as used by `OTEL_EXPORTER_OTLP_HEADERS`
fn parse_header_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub cache: CacheConfig,
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub telemetry: TelemetryConfig,
}

impl AuditConfig {
    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            config.cache.url = url;
        } else if lookup("REDIS_HOST").is_some() || lookup("REDIS_PORT").is_some() {
            let host = lookup("REDIS_HOST").unwrap_or_else(|| "my-redis-master".to_string());
            let port = lookup("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
            config.cache.url = format!("redis://{}:{}/0", host, port);
        }
        if let Some(password) = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()) {
            config.cache.password = Some(password);
        }

        if let Some(url) = lookup("NATS_URL") {
            config.broker.url = url;
        }
        if let Some(token) = lookup("NATS_TOKEN").filter(|t| !t.is_empty()) {
            config.broker.token = Some(token);
        }
        if let Some(name) = lookup("OTEL_SERVICE_NAME") {
            config.telemetry.service_name = name;
        }
        if let Some(addr) = lookup("METRICS_ADDR") {
            config.telemetry.metrics_addr = Some(addr);
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT") {
            config.telemetry.otlp_endpoint = Some(endpoint);
        } else if let Some(base) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.telemetry.otlp_endpoint =
                Some(format!("{}/v1/traces", base.trim_end_matches('/')));
        }
        if let Some(headers) = lookup("OTEL_EXPORTER_OTLP_HEADERS") {
            config.telemetry.otlp_headers = parse_header_list(&headers);
        }
        if let Some(flag) = lookup("LOG_JSON") {
            config.telemetry.json_logs = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Semantic checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_attempts == 0 {
            return Err(ObserveError::Config(
                "cache.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.cache.list_key.is_empty() {
            return Err(ObserveError::Config("cache.list_key must not be empty".to_string()));
        }
        if self.broker.topic.is_empty() {
            return Err(ObserveError::Config("broker.topic must not be empty".to_string()));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(ObserveError::Config(
                "publisher.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.telemetry.otlp_batch_size == 0 || self.telemetry.otlp_queue_capacity == 0 {
            return Err(ObserveError::Config(
                "telemetry.otlp_batch_size and otlp_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.publisher.drain_max > DRAIN_CAPACITY {
            return Err(ObserveError::Config(format!(
                "publisher.drain_max must not exceed {}",
                DRAIN_CAPACITY
            )));
        }
        Ok(())
    }
}
