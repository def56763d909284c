//! OTLP/HTTP span export
//!
//! Closed spans are queued without blocking and posted in batches by a
//! background task as OTLP JSON (`ExportTraceServiceRequest`) to the
//! collector's traces endpoint. A full queue or a failed request drops the
//! spans involved; nothing is retried.

use crate::config::TelemetryConfig;
use crate::error::{ObserveError, Result};
use crate::telemetry::{AttributeValue, SpanExporter, SpanRecord, SINK_ERRORS};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SCOPE_NAME: &str = env!("CARGO_PKG_NAME");
const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Span kind and status codes from the OTLP trace protocol
const SPAN_KIND_INTERNAL: u8 = 1;
const STATUS_UNSET: u8 = 0;
const STATUS_ERROR: u8 = 2;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: Resource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
struct Resource {
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<OtlpSpan>,
}

#[derive(Debug, Serialize)]
struct Scope {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<KeyValue>,
    status: Status,
}

#[derive(Debug, Serialize)]
struct Status {
    code: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    message: String,
}

#[derive(Debug, Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

/// 64-bit integers travel as strings in OTLP JSON
#[derive(Debug, Serialize)]
enum AnyValue {
    #[serde(rename = "stringValue")]
    String(String),
    #[serde(rename = "intValue")]
    Int(String),
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "boolValue")]
    Bool(bool),
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(v) => AnyValue::String(v.clone()),
            AttributeValue::Int(v) => AnyValue::Int(v.to_string()),
            AttributeValue::Float(v) => AnyValue::Double(*v),
            AttributeValue::Bool(v) => AnyValue::Bool(*v),
        }
    }
}

impl From<&SpanRecord> for OtlpSpan {
    fn from(span: &SpanRecord) -> Self {
        let start = span.started_at.timestamp_nanos_opt().unwrap_or_default();
        let elapsed = i64::try_from(span.duration.as_nanos()).unwrap_or(i64::MAX);

        let status = match span.error_message() {
            Some(message) if span.error => Status {
                code: STATUS_ERROR,
                message: message.to_string(),
            },
            _ if span.error => Status {
                code: STATUS_ERROR,
                message: String::new(),
            },
            _ => Status {
                code: STATUS_UNSET,
                message: String::new(),
            },
        };

        Self {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            parent_span_id: span.parent_span_id.clone(),
            name: span.name.clone(),
            kind: SPAN_KIND_INTERNAL,
            start_time_unix_nano: start.to_string(),
            end_time_unix_nano: start.saturating_add(elapsed).to_string(),
            attributes: span
                .attributes
                .iter()
                .map(|(key, value)| KeyValue {
                    key: key.clone(),
                    value: value.into(),
                })
                .collect(),
            status,
        }
    }
}

fn encode(service_name: &str, spans: &[SpanRecord]) -> ExportRequest {
    ExportRequest {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![KeyValue {
                    key: "service.name".to_string(),
                    value: AnyValue::String(service_name.to_string()),
                }],
            },
            scope_spans: vec![ScopeSpans {
                scope: Scope {
                    name: SCOPE_NAME,
                    version: SCOPE_VERSION,
                },
                spans: spans.iter().map(OtlpSpan::from).collect(),
            }],
        }],
    }
}

fn header_map(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ObserveError::Config(format!("invalid OTLP header '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ObserveError::Config(format!("invalid OTLP header value: {}", e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Batches closed spans to an OTLP/HTTP collector
pub struct OtlpSpanExporter {
    endpoint: String,
    sender: Mutex<Option<mpsc::Sender<SpanRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OtlpSpanExporter {
    /// Start the export task on the current tokio runtime
    pub fn spawn(config: &TelemetryConfig) -> Result<Self> {
        let endpoint = config
            .otlp_endpoint
            .clone()
            .ok_or_else(|| ObserveError::Config("otlp_endpoint is not set".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ObserveError::Config(format!("OTLP exporter needs a tokio runtime: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.otlp_timeout())
            .default_headers(header_map(&config.otlp_headers)?)
            .build()
            .map_err(|e| ObserveError::Config(format!("OTLP http client: {}", e)))?;

        let (sender, receiver) = mpsc::channel(config.otlp_queue_capacity.max(1));
        let worker = Worker {
            client,
            endpoint: endpoint.clone(),
            service_name: config.service_name.clone(),
            batch_size: config.otlp_batch_size.max(1),
        };
        let handle = runtime.spawn(worker.run(receiver));

        tracing::info!(endpoint = %endpoint, "OTLP span exporter started");

        Ok(Self {
            endpoint,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SpanExporter for OtlpSpanExporter {
    fn export(&self, span: SpanRecord) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|e| ObserveError::Export(format!("lock poisoned: {}", e)))?;
        let Some(sender) = sender.as_ref() else {
            return Err(ObserveError::Export("OTLP exporter is shut down".to_string()));
        };

        sender.try_send(span).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ObserveError::Export("OTLP export queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ObserveError::Export("OTLP export task has stopped".to_string())
            }
        })
    }

    /// Close the queue and wait until every queued span has been posted
    async fn shutdown(&self) -> Result<()> {
        drop(self.sender.lock().ok().and_then(|mut s| s.take()));

        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| ObserveError::Export(format!("OTLP export task failed: {}", e)))?;
        }
        Ok(())
    }
}

struct Worker {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
    batch_size: usize,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<SpanRecord>) {
        let mut batch = Vec::with_capacity(self.batch_size);

        while receiver.recv_many(&mut batch, self.batch_size).await > 0 {
            if let Err(e) = self.post(&batch).await {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    spans = batch.len(),
                    error = %e,
                    "Failed to export spans"
                );
                metrics::counter!(SINK_ERRORS, "sink" => "otlp").increment(1);
            }
            batch.clear();
        }

        tracing::debug!(endpoint = %self.endpoint, "OTLP span exporter stopped");
    }

    async fn post(&self, spans: &[SpanRecord]) -> Result<()> {
        let body = encode(&self.service_name, spans);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ObserveError::Export(format!("OTLP request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObserveError::Export(format!("collector returned {}", status)));
        }

        tracing::trace!(endpoint = %self.endpoint, spans = spans.len(), "Spans exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Telemetry, ATTR_USERNAME};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "otlp-test".to_string(),
            otlp_endpoint: Some(format!("{}/v1/traces", server.uri())),
            otlp_headers: [("x-tenant".to_string(), "blue".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spans_posted_as_otlp_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("x-tenant", "blue"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let exporter = Arc::new(OtlpSpanExporter::spawn(&config_for(&server)).unwrap());
        let telemetry = Telemetry::new("otlp-test", exporter.clone());

        let result: std::result::Result<(), String> = telemetry
            .with_span("login", async {
                Telemetry::annotate(ATTR_USERNAME, "alice");
                Err("Invalid credentials".to_string())
            })
            .await;
        assert!(result.is_err());
        telemetry.shutdown().await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();

        let resource = &body["resourceSpans"][0];
        assert_eq!(resource["resource"]["attributes"][0]["key"], "service.name");
        assert_eq!(
            resource["resource"]["attributes"][0]["value"]["stringValue"],
            "otlp-test"
        );

        let span = &resource["scopeSpans"][0]["spans"][0];
        assert_eq!(span["name"], "login");
        assert_eq!(span["traceId"].as_str().unwrap().len(), 32);
        assert_eq!(span["spanId"].as_str().unwrap().len(), 16);
        assert_eq!(span["status"]["code"], 2);
        assert_eq!(span["status"]["message"], "Invalid credentials");

        let attributes = span["attributes"].as_array().unwrap();
        assert!(attributes.iter().any(|kv| {
            kv["key"] == "user.username" && kv["value"]["stringValue"] == "alice"
        }));
        assert!(attributes
            .iter()
            .any(|kv| kv["key"] == "error" && kv["value"]["boolValue"] == true));
    }

    #[tokio::test]
    async fn test_collector_failure_does_not_change_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let exporter = Arc::new(OtlpSpanExporter::spawn(&config_for(&server)).unwrap());
        let telemetry = Telemetry::new("otlp-test", exporter);

        let value: std::result::Result<u8, String> =
            telemetry.with_span("list_messages", async { Ok(3) }).await;
        telemetry.shutdown().await;

        assert_eq!(value, Ok(3));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_export_after_shutdown_is_rejected() {
        let server = MockServer::start().await;
        let exporter = OtlpSpanExporter::spawn(&config_for(&server)).unwrap();
        assert_eq!(exporter.endpoint(), format!("{}/v1/traces", server.uri()));

        exporter.shutdown().await.unwrap();

        let telemetry = Telemetry::new("otlp-test", Arc::new(exporter));
        let _: std::result::Result<(), String> = telemetry.with_span("late", async { Ok(()) }).await;
        assert_eq!(
            telemetry.counter_value(SINK_ERRORS, &[("sink", "span_exporter")]),
            1
        );
    }

    #[test]
    fn test_spawn_requires_endpoint_and_runtime() {
        assert!(matches!(
            OtlpSpanExporter::spawn(&TelemetryConfig::default()),
            Err(ObserveError::Config(_))
        ));

        let config = TelemetryConfig {
            otlp_endpoint: Some("http://127.0.0.1:4318/v1/traces".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            OtlpSpanExporter::spawn(&config),
            Err(ObserveError::Config(_))
        ));
    }

    #[test]
    fn test_int_attributes_encoded_as_strings() {
        let value = serde_json::to_value(AnyValue::from(&AttributeValue::Int(42))).unwrap();
        assert_eq!(value, serde_json::json!({"intValue": "42"}));
    }
}
