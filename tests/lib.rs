// Shared fixtures for pointgate behavior tests
pub use pointgate_core::{
    circuit_breaker::CircuitBreaker,
    downstream::{DownstreamError, ScriptedAccumulationClient, ScriptedReply},
    events::{EventType, RecordingEventPublisher},
    ledger::{FailureLedger, InMemoryLedger},
    pipeline::{AccumulationCommand, AdmissionPipeline},
    policy::{PartnerPolicy, PolicySet},
    scheduler::{RetryScheduler, SchedulerSettings},
    AccumulationError, CircuitBreakerRegistry, CircuitState, RateLimiterRegistry,
};
pub use pointgate_ledger::{AccumulationRecord, PartnerClass, RecordStatus};
pub use std::sync::Arc;

/// A pipeline and scheduler wired to scripted collaborators.
pub struct Gateway {
    pub pipeline: Arc<AdmissionPipeline>,
    pub scheduler: Arc<RetryScheduler>,
    pub client: Arc<ScriptedAccumulationClient>,
    pub ledger: Arc<dyn FailureLedger>,
    pub publisher: Arc<RecordingEventPublisher>,
}

impl Gateway {
    pub fn in_memory(
        fallback: ScriptedReply,
        policies: impl IntoIterator<Item = PartnerPolicy>,
        max_retry_count: u32,
    ) -> (Self, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Self::with_ledger(fallback, policies, max_retry_count, ledger.clone());
        (gateway, ledger)
    }

    pub fn with_ledger(
        fallback: ScriptedReply,
        policies: impl IntoIterator<Item = PartnerPolicy>,
        max_retry_count: u32,
        ledger: Arc<dyn FailureLedger>,
    ) -> Self {
        let policies = PolicySet::new(policies);
        let client = Arc::new(ScriptedAccumulationClient::new(fallback));
        let publisher = Arc::new(RecordingEventPublisher::new());
        let pipeline = Arc::new(AdmissionPipeline::new(
            policies.clone(),
            Arc::new(RateLimiterRegistry::new(&policies)),
            Arc::new(CircuitBreakerRegistry::new()),
            client.clone(),
            ledger.clone(),
            publisher.clone(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&pipeline),
            SchedulerSettings {
                max_retry_count,
                ..SchedulerSettings::default()
            },
        ));

        Self {
            pipeline,
            scheduler,
            client,
            ledger,
            publisher,
        }
    }

    pub fn breaker(&self, partner_class: PartnerClass) -> Option<Arc<CircuitBreaker>> {
        self.pipeline
            .breakers()
            .get(&self.pipeline.target_for(partner_class))
    }
}

pub fn server_error() -> DownstreamError {
    DownstreamError::from_status(503, "point service unavailable")
}

pub fn timeout() -> DownstreamError {
    DownstreamError::Timeout { timeout_ms: 3_000 }
}

/// Move a record's last reconciliation far enough into the past to be due again.
pub fn make_due(ledger: &InMemoryLedger, id: &str) {
    if let Some(mut record) = ledger.get(id) {
        record.last_retry_time =
            Some(time::OffsetDateTime::now_utc() - time::Duration::minutes(10));
        ledger.insert(record);
    }
}
