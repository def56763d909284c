//! Per-request audit reporting
//!
//! `RequestAuditFacade::report` fans one terminal outcome out to every
//! sink, in a fixed order:
//!
//! 1. `api.calls` counter
//! 2. current span error attributes and a log line
//! 3. recent-activity entry
//! 4. durable audit event
//!
//! Every step is isolated from the others and none of them can fail the
//! caller.

use crate::activity::RecentActivityLog;
use crate::publisher::AuditPublisher;
use crate::telemetry::Telemetry;
use crate::types::{AuditEvent, Outcome};

/// Terminal outcome of one business operation
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Logical operation name (e.g., "/db/message")
    pub operation: String,
    pub method: String,
    pub actor_id: Option<String>,
    pub outcome: Outcome,
    /// Recent-activity details
    pub detail: String,
    /// Error message attached to the current span on failure
    pub error: Option<String>,
    /// Recent-activity action tag; derived from `operation` when unset
    pub action: Option<String>,
}

impl Report {
    pub fn success(operation: impl Into<String>, method: impl Into<String>) -> Self {
        let operation = operation.into();
        let method = method.into();
        Self {
            detail: format!("{} {}", method, operation),
            operation,
            method,
            actor_id: None,
            outcome: Outcome::Success,
            error: None,
            action: None,
        }
    }

    pub fn failure(
        operation: impl Into<String>,
        method: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            operation: operation.into(),
            method: method.into(),
            actor_id: None,
            outcome: Outcome::Error,
            detail: error.clone(),
            error: Some(error),
            action: None,
        }
    }

    pub fn actor(mut self, actor_id: Option<impl Into<String>>) -> Self {
        self.actor_id = actor_id.map(Into::into);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// The recent-activity tag for this report
    ///
    /// `/db/message` becomes `db_message`, with `_error` appended on failure.
    pub fn action_tag(&self) -> String {
        if let Some(ref action) = self.action {
            return action.clone();
        }
        let slug = action_slug(&self.operation);
        match self.outcome {
            Outcome::Success => slug,
            Outcome::Error => format!("{}_error", slug),
        }
    }
}

/// Turn an operation path into an identifier-style tag
pub fn action_slug(operation: &str) -> String {
    let slug: String = operation
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if slug.is_empty() {
        "root".to_string()
    } else {
        slug
    }
}

/// Fans request outcomes out to counters, spans, logs, cache, and broker
#[derive(Clone)]
pub struct RequestAuditFacade {
    telemetry: Telemetry,
    activity: RecentActivityLog,
    publisher: AuditPublisher,
}

impl RequestAuditFacade {
    pub fn new(telemetry: Telemetry, activity: RecentActivityLog, publisher: AuditPublisher) -> Self {
        Self {
            telemetry,
            activity,
            publisher,
        }
    }

    /// Record one terminal outcome
    pub async fn report(&self, report: Report) {
        self.telemetry
            .record_request(&report.operation, &report.method, report.outcome);

        let actor = report.actor_id.as_deref().unwrap_or("anonymous");
        match report.outcome {
            Outcome::Error => {
                let message = report.error.as_deref().unwrap_or(&report.detail);
                if let Some(span) = Telemetry::current_span() {
                    span.record_error(message);
                }
                tracing::error!(
                    endpoint = %report.operation,
                    method = %report.method,
                    actor,
                    error = %message,
                    "Request failed"
                );
            }
            Outcome::Success => {
                tracing::info!(
                    endpoint = %report.operation,
                    method = %report.method,
                    actor,
                    "Request succeeded"
                );
            }
        }

        self.activity
            .record(&report.action_tag(), &report.detail)
            .await;

        self.publisher.publish(AuditEvent::new(
            report.operation,
            report.method,
            report.outcome,
            report.actor_id,
        ));
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn activity(&self) -> &RecentActivityLog {
        &self.activity
    }

    pub fn publisher(&self) -> &AuditPublisher {
        &self.publisher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, ResilientConnector};
    use crate::config::{BrokerConfig, PublisherConfig};
    use crate::provider::memory::MemoryBroker;
    use crate::telemetry::{MemorySpanExporter, API_CALLS, ATTR_ERROR, SINK_ERRORS};
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        facade: RequestAuditFacade,
        cache: MemoryCache,
        broker: MemoryBroker,
        spans: Arc<MemorySpanExporter>,
    }

    fn harness() -> Harness {
        let spans = Arc::new(MemorySpanExporter::new());
        let telemetry = Telemetry::new("test", spans.clone());
        let cache = MemoryCache::new();
        let broker = MemoryBroker::new();
        let connector = ResilientConnector::new(Arc::new(cache.clone()), 3, Duration::from_secs(2));
        let activity = RecentActivityLog::new(connector, "api_logs", telemetry.clone());
        let publisher = AuditPublisher::spawn(
            Arc::new(broker.clone()),
            &BrokerConfig::default(),
            &PublisherConfig::default(),
            telemetry.clone(),
        );
        Harness {
            facade: RequestAuditFacade::new(telemetry, activity, publisher),
            cache,
            broker,
            spans,
        }
    }

    fn login_labels(status: &'static str) -> [(&'static str, &'static str); 3] {
        [("endpoint", "/login"), ("method", "POST"), ("status", status)]
    }

    #[test]
    fn test_action_slug() {
        assert_eq!(action_slug("/db/message"), "db_message");
        assert_eq!(action_slug("/db/messages/search"), "db_messages_search");
        assert_eq!(action_slug("/logs/redis"), "logs_redis");
        assert_eq!(action_slug("/"), "root");
    }

    #[test]
    fn test_action_tag_defaults_and_override() {
        assert_eq!(Report::success("/db/message", "POST").action_tag(), "db_message");
        assert_eq!(
            Report::failure("/db/message", "POST", "boom").action_tag(),
            "db_message_error"
        );
        assert_eq!(
            Report::success("/db/message", "POST").action("db_insert").action_tag(),
            "db_insert"
        );
    }

    #[tokio::test]
    async fn test_anonymous_login_failure() {
        let h = harness();

        h.facade
            .report(Report::failure("/login", "POST", "Invalid credentials").actor(None::<String>))
            .await;
        h.facade.publisher().flush().await.unwrap();

        let telemetry = h.facade.telemetry();
        assert_eq!(telemetry.counter_value(API_CALLS, &login_labels("error")), 1);
        assert_eq!(telemetry.counter_value(API_CALLS, &login_labels("success")), 0);

        let events = h.broker.events("api-logs");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_id, None);
        assert_eq!(events[0].status, Outcome::Error);

        let recent = h.facade.activity().read_recent(1).await.unwrap();
        assert_eq!(recent[0].entry().unwrap().action, "login_error");
        assert_eq!(recent[0].entry().unwrap().details, "Invalid credentials");
    }

    #[tokio::test]
    async fn test_success_counts_only_success() {
        let h = harness();

        h.facade
            .report(Report::success("/login", "POST").actor(Some("alice")))
            .await;
        h.facade.publisher().flush().await.unwrap();

        let telemetry = h.facade.telemetry();
        assert_eq!(telemetry.counter_value(API_CALLS, &login_labels("success")), 1);
        assert_eq!(telemetry.counter_value(API_CALLS, &login_labels("error")), 0);
        assert_eq!(h.broker.events("api-logs")[0].actor_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_error_annotates_current_span() {
        let h = harness();
        let facade = h.facade.clone();

        let _: Result<(), String> = h
            .facade
            .telemetry()
            .with_span("save_message", async move {
                facade
                    .report(Report::failure("/db/message", "POST", "disk full"))
                    .await;
                Ok(())
            })
            .await;

        let span = &h.spans.named("save_message")[0];
        assert!(span.error);
        assert_eq!(span.error_message(), Some("disk full"));
        assert!(span.attribute(ATTR_ERROR).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_sinks_down_never_fails_caller() {
        let h = harness();
        h.cache.set_available(false);
        h.broker.set_available(false);

        h.facade
            .report(Report::success("/db/messages", "GET").actor(Some("bob")))
            .await;
        h.facade.publisher().flush().await.unwrap();

        let telemetry = h.facade.telemetry();
        assert_eq!(telemetry.counter_total(API_CALLS), 1);
        assert_eq!(telemetry.counter_value(SINK_ERRORS, &[("sink", "recent_activity")]), 1);
        assert_eq!(telemetry.counter_value(SINK_ERRORS, &[("sink", "audit_publisher")]), 1);
    }
}
