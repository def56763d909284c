//! Telemetry: spans and counters
//!
//! `Telemetry` is constructed once at process start and passed to whatever
//! needs it. It provides:
//! - Spans with free-form attributes and an error flag, closed exactly once
//!   by a drop guard on every exit path (including panics and cancellation)
//! - Monotonic counters, forwarded to the `metrics` facade and mirrored in an
//!   in-process snapshot
//! - Subscriber and Prometheus exporter setup
//! - Span export: OTLP/HTTP to a collector when an endpoint is configured,
//!   a debug log line otherwise
//!
//! Every span is also a `tracing` span carrying `otel.name` and the
//! attributes below, so layers installed by the embedding process see the
//! same data the exporter does.
//!
//! ## Instruments
//!
//! ```text
//! api.calls           {endpoint, method, status}
//! db.operations       {operation, table}
//! audit.sink_errors   {sink}
//! ```

use crate::config::TelemetryConfig;
use crate::error::{ObserveError, Result};
use crate::otlp::OtlpSpanExporter;
use crate::types::Outcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::Instrument;

// Instrument names
pub const API_CALLS: &str = "api.calls";
pub const DB_OPERATIONS: &str = "db.operations";
pub const SINK_ERRORS: &str = "audit.sink_errors";

// Attribute keys
pub const ATTR_ERROR: &str = "error";
pub const ATTR_ERROR_MESSAGE: &str = "error.message";
pub const ATTR_STATUS_CODE: &str = "otel.status_code";
pub const ATTR_USER_ID: &str = "user.id";
pub const ATTR_USERNAME: &str = "user.username";
pub const ATTR_MESSAGE_LENGTH: &str = "message.length";
pub const ATTR_CACHE_LEN: &str = "cache.len";

tokio::task_local! {
    static CURRENT_SPAN: SpanHandle;
}

/// A span attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(v) => f.write_str(v),
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl AttributeValue {
    fn record_on(&self, span: &tracing::Span, key: &str) {
        match self {
            AttributeValue::String(v) => {
                span.record(key, v.as_str());
            }
            AttributeValue::Int(v) => {
                span.record(key, *v);
            }
            AttributeValue::Float(v) => {
                span.record(key, *v);
            }
            AttributeValue::Bool(v) => {
                span.record(key, *v);
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<usize> for AttributeValue {
    fn from(v: usize) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

/// A closed span, as handed to the exporter
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub name: String,
    /// 32 hex digits, shared by nested spans
    pub trace_id: String,
    /// 16 hex digits
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub error: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SpanRecord {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self.attributes.get(ATTR_ERROR_MESSAGE) {
            Some(AttributeValue::String(message)) => Some(message),
            _ => None,
        }
    }
}

struct SpanState {
    name: String,
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    span: tracing::Span,
    attributes: BTreeMap<String, AttributeValue>,
    error: bool,
    started_at: DateTime<Utc>,
    start: Instant,
}

/// Handle onto an open span
///
/// Cheap to clone; all clones refer to the same span.
#[derive(Clone)]
pub struct SpanHandle {
    state: Arc<Mutex<SpanState>>,
}

impl SpanHandle {
    fn start(name: &str, parent: Option<&SpanHandle>, span: tracing::Span) -> Self {
        let (trace_id, parent_span_id) = match parent {
            Some(parent) => {
                let parent = parent.state();
                (parent.trace_id.clone(), Some(parent.span_id.clone()))
            }
            None => (uuid::Uuid::new_v4().simple().to_string(), None),
        };
        let mut span_id = uuid::Uuid::new_v4().simple().to_string();
        span_id.truncate(16);

        Self {
            state: Arc::new(Mutex::new(SpanState {
                name: name.to_string(),
                trace_id,
                span_id,
                parent_span_id,
                span,
                attributes: BTreeMap::new(),
                error: false,
                started_at: Utc::now(),
                start: Instant::now(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SpanState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn trace_id(&self) -> String {
        self.state().trace_id.clone()
    }

    /// Set an attribute; keys declared on the `tracing` span are mirrored there
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let (key, value) = (key.into(), value.into());
        let mut state = self.state();
        value.record_on(&state.span, &key);
        state.attributes.insert(key, value);
    }

    /// Flag the span as failed
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state();
        state.span.record(ATTR_ERROR, true);
        state.span.record(ATTR_ERROR_MESSAGE, message.as_str());
        state.span.record(ATTR_STATUS_CODE, "ERROR");
        state.error = true;
        state
            .attributes
            .insert(ATTR_ERROR.to_string(), AttributeValue::Bool(true));
        state
            .attributes
            .insert(ATTR_ERROR_MESSAGE.to_string(), AttributeValue::String(message));
    }

    pub fn is_error(&self) -> bool {
        self.state().error
    }

    fn finish(&self) -> SpanRecord {
        let state = self.state();
        SpanRecord {
            name: state.name.clone(),
            trace_id: state.trace_id.clone(),
            span_id: state.span_id.clone(),
            parent_span_id: state.parent_span_id.clone(),
            attributes: state.attributes.clone(),
            error: state.error,
            started_at: state.started_at,
            duration: state.start.elapsed(),
        }
    }
}

/// Destination for closed spans
///
/// `export` runs inside a drop guard, so it must not block.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: SpanRecord) -> Result<()>;

    /// Flush anything buffered; called once at process exit
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes closed spans to the tracing subscriber
#[derive(Debug, Default)]
pub struct LogSpanExporter;

impl SpanExporter for LogSpanExporter {
    fn export(&self, span: SpanRecord) -> Result<()> {
        tracing::debug!(
            span = %span.name,
            error = span.error,
            duration_ms = span.duration.as_millis() as u64,
            attributes = ?span.attributes,
            "Span closed"
        );
        Ok(())
    }
}

/// Collects closed spans in memory
#[derive(Default)]
pub struct MemorySpanExporter {
    spans: Mutex<Vec<SpanRecord>>,
}

impl MemorySpanExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .unwrap_or_default()
    }

    /// All closed spans with the given name
    pub fn named(&self, name: &str) -> Vec<SpanRecord> {
        self.spans()
            .into_iter()
            .filter(|span| span.name == name)
            .collect()
    }
}

impl SpanExporter for MemorySpanExporter {
    fn export(&self, span: SpanRecord) -> Result<()> {
        self.spans
            .lock()
            .map_err(|e| ObserveError::Export(format!("lock poisoned: {}", e)))?
            .push(span);
        Ok(())
    }
}

/// Closes its span when dropped
struct SpanGuard {
    handle: SpanHandle,
    telemetry: Telemetry,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let record = self.handle.finish();
        let name = record.name.clone();
        if let Err(e) = self.telemetry.inner.exporter.export(record) {
            tracing::warn!(span = %name, error = %e, "Failed to export span");
            self.telemetry.sink_error("span_exporter");
        }
    }
}

/// Identity of one counter series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub instrument: String,
    /// Label pairs, sorted by key
    pub labels: Vec<(String, String)>,
}

impl CounterKey {
    fn new(instrument: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            instrument: instrument.to_string(),
            labels,
        }
    }
}

struct Inner {
    service_name: String,
    exporter: Arc<dyn SpanExporter>,
    counters: DashMap<CounterKey, u64>,
}

/// Span and counter entry point
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    /// Build a telemetry instance without touching global state
    pub fn new(service_name: impl Into<String>, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service_name: service_name.into(),
                exporter,
                counters: DashMap::new(),
            }),
        }
    }

    /// Process-start initialization: subscriber, optional Prometheus
    /// listener, and the span exporter
    ///
    /// With `otlp_endpoint` set, spans are posted to that collector and this
    /// must be called from within a tokio runtime.
    pub fn init(config: &TelemetryConfig) -> Result<Self> {
        Self::init_subscriber(config)?;

        if let Some(ref addr) = config.metrics_addr {
            Self::install_prometheus(addr)?;
        }

        let exporter: Arc<dyn SpanExporter> = match config.otlp_endpoint {
            Some(_) => Arc::new(OtlpSpanExporter::spawn(config)?),
            None => Arc::new(LogSpanExporter),
        };

        tracing::info!(
            service.name = %config.service_name,
            metrics_addr = ?config.metrics_addr,
            otlp_endpoint = ?config.otlp_endpoint,
            "Telemetry initialized"
        );

        Ok(Self::new(config.service_name.clone(), exporter))
    }

    /// Install the global tracing subscriber
    pub fn init_subscriber(config: &TelemetryConfig) -> Result<()> {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
        let json = config.json_logs.then(|| fmt::layer().json());
        let plain = (!config.json_logs).then(|| fmt::layer());

        tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(plain)
            .try_init()
            .map_err(|e| ObserveError::Config(format!("tracing subscriber: {}", e)))
    }

    /// Install the Prometheus recorder with an HTTP scrape listener
    pub fn install_prometheus(addr: &str) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ObserveError::Config(format!("invalid metrics address '{}': {}", addr, e)))?;

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| ObserveError::Export(format!("prometheus exporter: {}", e)))?;

        metrics::describe_counter!(API_CALLS, "The number of API calls by endpoint and method");
        metrics::describe_counter!(DB_OPERATIONS, "The number of database operations by type");
        metrics::describe_counter!(SINK_ERRORS, "Observability sink failures that were swallowed");

        tracing::info!(%addr, "Prometheus exporter listening");
        Ok(())
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Run `body` inside a span named `name`
    ///
    /// The span is the current span for the whole of `body`, so attributes
    /// can be attached with [`Telemetry::annotate`]. An `Err` from `body`
    /// flags the span and records its message before the span closes.
    /// A span opened inside another joins its trace.
    pub async fn with_span<T, E, F>(&self, name: &str, body: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        // `tracing` span names are static; exporters rename from `otel.name`
        let span = tracing::info_span!(
            "operation",
            otel.name = %name,
            otel.status_code = tracing::field::Empty,
            service.name = %self.inner.service_name,
            error = tracing::field::Empty,
            error.message = tracing::field::Empty,
            user.id = tracing::field::Empty,
            user.username = tracing::field::Empty,
            message.length = tracing::field::Empty,
            cache.len = tracing::field::Empty
        );
        let parent = Self::current_span();
        let handle = SpanHandle::start(name, parent.as_ref(), span.clone());
        let guard = SpanGuard {
            handle: handle.clone(),
            telemetry: self.clone(),
        };

        let result = CURRENT_SPAN
            .scope(handle.clone(), body.instrument(span))
            .await;

        if let Err(ref e) = result {
            handle.record_error(e.to_string());
        }
        drop(guard);
        result
    }

    /// The span enclosing the running task, if any
    pub fn current_span() -> Option<SpanHandle> {
        CURRENT_SPAN.try_with(|span| span.clone()).ok()
    }

    /// Attach an attribute to the current span; no-op outside a span
    pub fn annotate(key: &str, value: impl Into<AttributeValue>) {
        if let Some(span) = Self::current_span() {
            span.set_attribute(key, value);
        }
    }

    /// Add one to a counter series
    pub fn increment(&self, instrument: &str, labels: &[(&str, &str)]) {
        let key = CounterKey::new(instrument, labels);
        let metric_labels: Vec<metrics::Label> = key
            .labels
            .iter()
            .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
            .collect();

        *self.inner.counters.entry(key).or_insert(0) += 1;
        metrics::counter!(instrument.to_string(), metric_labels).increment(1);
    }

    /// Count one request by endpoint, method, and outcome
    pub fn record_request(&self, endpoint: &str, method: &str, outcome: Outcome) {
        self.increment(
            API_CALLS,
            &[
                ("endpoint", endpoint),
                ("method", method),
                ("status", outcome.as_str()),
            ],
        );
    }

    /// Count one relational-store operation
    pub fn db_operation(&self, operation: &str, table: &str) {
        self.increment(DB_OPERATIONS, &[("operation", operation), ("table", table)]);
    }

    /// Count one swallowed observability failure
    pub fn sink_error(&self, sink: &str) {
        self.increment(SINK_ERRORS, &[("sink", sink)]);
    }

    /// Current value of a counter series (0 if never incremented)
    pub fn counter_value(&self, instrument: &str, labels: &[(&str, &str)]) -> u64 {
        let key = CounterKey::new(instrument, labels);
        self.inner.counters.get(&key).map(|v| *v).unwrap_or(0)
    }

    /// Sum over every series of an instrument
    pub fn counter_total(&self, instrument: &str) -> u64 {
        self.inner
            .counters
            .iter()
            .filter(|entry| entry.key().instrument == instrument)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Snapshot of all counter series
    pub fn counters(&self) -> Vec<(CounterKey, u64)> {
        self.inner
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Flush the span exporter; call once at process exit
    pub async fn shutdown(&self) {
        if let Err(e) = self.inner.exporter.shutdown().await {
            tracing::warn!(error = %e, "Span exporter shutdown failed");
        }
        tracing::info!(
            service.name = %self.inner.service_name,
            series = self.inner.counters.len(),
            "Telemetry shut down"
        );
    }
}
