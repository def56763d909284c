//! Process-wide wiring of the audit components

use crate::activity::RecentActivityLog;
use crate::cache::{CacheBackend, RedisBackend, ResilientConnector};
use crate::config::AuditConfig;
use crate::error::Result;
use crate::facade::RequestAuditFacade;
use crate::provider::nats::NatsBroker;
use crate::provider::BrokerConnector;
use crate::publisher::AuditPublisher;
use crate::service::{Backend, PasswordHasher};
use crate::session::SessionRegistry;
use crate::store::RecordStore;
use crate::telemetry::Telemetry;
use std::sync::Arc;

/// Every audit component, built once at process start
pub struct AuditStack {
    telemetry: Telemetry,
    sessions: SessionRegistry,
    facade: RequestAuditFacade,
}

impl AuditStack {
    /// Wire components around the given backends
    ///
    /// Must be called inside a tokio runtime: the publisher task is spawned
    /// here.
    pub fn build(
        config: &AuditConfig,
        cache: Arc<dyn CacheBackend>,
        broker: Arc<dyn BrokerConnector>,
        telemetry: Telemetry,
    ) -> Self {
        let connector = ResilientConnector::from_config(cache, &config.cache);
        let activity = RecentActivityLog::new(
            connector.clone(),
            config.cache.list_key.clone(),
            telemetry.clone(),
        );
        let sessions =
            SessionRegistry::new(connector, config.cache.session_ttl(), telemetry.clone());
        let publisher = AuditPublisher::spawn(
            broker,
            &config.broker,
            &config.publisher,
            telemetry.clone(),
        );

        Self {
            facade: RequestAuditFacade::new(telemetry.clone(), activity, publisher),
            sessions,
            telemetry,
        }
    }

    /// Initialize telemetry and wire Redis and NATS from `config`
    ///
    /// Neither backend is contacted here; both connect on first use.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        config.validate()?;
        let telemetry = Telemetry::init(&config.telemetry)?;
        let cache = Arc::new(RedisBackend::new(&config.cache)?);
        let broker = Arc::new(NatsBroker::new(config.broker.clone()));
        Ok(Self::build(config, cache, broker, telemetry))
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn facade(&self) -> &RequestAuditFacade {
        &self.facade
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// A message board backend reporting through this stack
    pub fn backend(
        &self,
        store: Arc<dyn RecordStore>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Backend {
        Backend::new(store, hasher, self.sessions.clone(), self.facade.clone())
    }

    /// Flush queued audit events and the span exporter
    pub async fn shutdown(&self) {
        self.facade.publisher().shutdown().await;
        self.telemetry.shutdown().await;
    }
}
