//! Composition root wiring policies, shared state, transport and storage together.

use std::sync::Arc;

use pointgate_ledger::{Ledger, LedgerError};
use thiserror::Error;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{ConfigError, GatewayConfig};
use crate::downstream::{AccumulationClient, HttpAccumulationClient, MockAccumulationClient};
use crate::events::{EventPublishError, EventPublisher, LoggingEventPublisher, NatsEventPublisher};
use crate::ledger::FailureLedger;
use crate::pipeline::AdmissionPipeline;
use crate::policy::PolicySet;
use crate::rate_limiter::RateLimiterRegistry;
use crate::scheduler::RetryScheduler;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Events(#[from] EventPublishError),
}

/// Process-wide owner of limiter and breaker state.
pub struct ControlPlane {
    config: GatewayConfig,
    ledger: Ledger,
    pipeline: Arc<AdmissionPipeline>,
    scheduler: Arc<RetryScheduler>,
}

/// Builder for [`ControlPlane`].
#[derive(Clone)]
pub struct ControlPlaneBuilder {
    config: GatewayConfig,
    use_mock: bool,
    client: Option<Arc<dyn AccumulationClient>>,
}

impl ControlPlaneBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            use_mock: false,
            client: None,
        }
    }

    /// Use the deterministic offline client instead of HTTP.
    pub fn with_mock_mode(mut self) -> Self {
        self.use_mock = true;
        self
    }

    pub fn with_client(mut self, client: Arc<dyn AccumulationClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub async fn build(self) -> Result<ControlPlane, ControlPlaneError> {
        let config = self.config;
        config.validate()?;

        let policies: PolicySet = config.policy_set();
        let limiters = Arc::new(RateLimiterRegistry::new(&policies));
        let breakers = Arc::new(CircuitBreakerRegistry::new());

        let client: Arc<dyn AccumulationClient> = match self.client {
            Some(client) => client,
            None if self.use_mock => {
                info!("using mock point service");
                Arc::new(MockAccumulationClient::default())
            }
            None => Arc::new(HttpAccumulationClient::new(
                config.downstream.name.clone(),
                config.downstream.base_url.clone(),
                config.call_timeout(),
            )),
        };

        let ledger = Ledger::open(config.ledger_config())?;
        info!(db_path = %ledger.db_path().display(), "ledger opened");
        let store: Arc<dyn FailureLedger> = Arc::new(ledger.clone());

        let publisher: Arc<dyn EventPublisher> = match &config.events.nats_url {
            Some(url) => Arc::new(
                NatsEventPublisher::connect(url, config.events.subject.clone()).await?,
            ),
            None => {
                warn!("no NATS url configured, lifecycle events will only be logged");
                Arc::new(LoggingEventPublisher)
            }
        };

        let pipeline = Arc::new(
            AdmissionPipeline::new(policies, limiters, breakers, client, store, publisher)
                .with_call_timeout(config.call_timeout())
                .with_publish_timeout(config.publish_timeout()),
        );
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&pipeline),
            config.scheduler.settings(),
        ));

        Ok(ControlPlane {
            config,
            ledger,
            pipeline,
            scheduler,
        })
    }
}

impl ControlPlane {
    pub fn builder(config: GatewayConfig) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(config)
    }

    pub async fn from_config(config: GatewayConfig, use_mock: bool) -> Result<Self, ControlPlaneError> {
        let builder = Self::builder(config);
        if use_mock {
            builder.with_mock_mode().build().await
        } else {
            builder.build().await
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Direct handle for inspection queries.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pipeline(&self) -> &Arc<AdmissionPipeline> {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::{ScriptedAccumulationClient, ScriptedReply};
    use crate::pipeline::AccumulationCommand;
    use pointgate_ledger::RecordStatus;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.ledger.path = Some(dir.join("ledger.duckdb"));
        config
    }

    #[tokio::test]
    async fn mock_mode_accumulates_into_duckdb() {
        let temp = tempdir().expect("tempdir");
        let plane = ControlPlane::from_config(config_in(temp.path()), true)
            .await
            .expect("build");

        let accumulated = plane
            .pipeline()
            .accumulate(&AccumulationCommand::new("M-1", "P-1", "mart", 12_300))
            .await
            .expect("accumulate");

        assert_eq!(accumulated.record.points, 123);
        let stored = plane
            .ledger()
            .find(&accumulated.record.id)
            .expect("find")
            .expect("stored");
        assert_eq!(stored.status, RecordStatus::Completed);
        assert_eq!(
            plane.pipeline().target_for(pointgate_ledger::PartnerClass::Mart),
            "mock-point-service.mart"
        );
    }

    #[tokio::test]
    async fn injected_client_takes_precedence() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(
            ScriptedAccumulationClient::new(ScriptedReply::ok(7)).with_name("partner-a"),
        );
        let plane = ControlPlane::builder(config_in(temp.path()))
            .with_mock_mode()
            .with_client(client.clone())
            .build()
            .await
            .expect("build");

        plane
            .pipeline()
            .accumulate(&AccumulationCommand::new("M-1", "P-1", "online", 700))
            .await
            .expect("accumulate");

        assert_eq!(client.calls(), 1);
        assert!(plane.pipeline().breakers().get("partner-a.online").is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_opening_anything() {
        let temp = tempdir().expect("tempdir");
        let mut config = config_in(temp.path());
        config.scheduler.concurrency = 0;

        let result = ControlPlane::from_config(config, true).await;

        assert!(matches!(result, Err(ControlPlaneError::Config(_))));
        assert!(!temp.path().join("ledger.duckdb").exists());
    }
}
