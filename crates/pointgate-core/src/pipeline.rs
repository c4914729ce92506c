//! Admission pipeline: rate limit, circuit breaker, downstream call, classification.
//!
//! Every stage is a separate method so it can be exercised on its own. The
//! synchronous [`AdmissionPipeline::accumulate`] path retries in-line and
//! records the final outcome; [`AdmissionPipeline::reconcile_once`] runs a
//! single pass for the retry scheduler and leaves bookkeeping to the caller.

use std::sync::Arc;
use std::time::Duration;

use pointgate_ledger::{AccumulationRecord, PartnerClass};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitOpen,
};
use crate::downstream::{AccumulationClient, AccumulationReceipt, AccumulationRequest, DownstreamError};
use crate::error::{AccumulationError, ValidationError};
use crate::events::{EventPublisher, EventType, LifecycleEvent};
use crate::ledger::FailureLedger;
use crate::policy::{PartnerPolicy, PolicySet};
use crate::rate_limiter::{Admission, RateLimiterRegistry};
use crate::retry::{FailureKind, GiveUpReason, RetryDecision, RetryPolicyEngine};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Raw inbound accumulation request, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulationCommand {
    pub member_id: String,
    pub partner_id: String,
    pub partner_class: String,
    pub amount: i64,
}

impl AccumulationCommand {
    pub fn new(
        member_id: impl Into<String>,
        partner_id: impl Into<String>,
        partner_class: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            partner_id: partner_id.into(),
            partner_class: partner_class.into(),
            amount,
        }
    }

    pub fn validate(&self) -> Result<AccumulationRequest, ValidationError> {
        let member_id = self.member_id.trim();
        if member_id.is_empty() {
            return Err(ValidationError::EmptyMemberId);
        }
        let partner_id = self.partner_id.trim();
        if partner_id.is_empty() {
            return Err(ValidationError::EmptyPartnerId);
        }
        if self.amount <= 0 {
            return Err(ValidationError::NonPositiveAmount {
                amount: self.amount,
            });
        }
        let partner_class = self.partner_class.parse::<PartnerClass>()?;

        Ok(AccumulationRequest {
            member_id: member_id.to_owned(),
            partner_id: partner_id.to_owned(),
            partner_class,
            amount: self.amount,
        })
    }
}

/// Successful synchronous accumulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accumulated {
    pub transaction_id: String,
    pub attempts: u32,
    pub record: AccumulationRecord,
}

/// Tagged result of one guarded downstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    Completed(AccumulationReceipt),
    CircuitOpen(CircuitOpen),
    Failed(DownstreamError),
}

/// Result of a single reconciliation pass for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(AccumulationReceipt),
    Throttled,
    CircuitOpen(CircuitOpen),
    Failed(DownstreamError),
}

pub struct AdmissionPipeline {
    policies: PolicySet,
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    client: Arc<dyn AccumulationClient>,
    ledger: Arc<dyn FailureLedger>,
    publisher: Arc<dyn EventPublisher>,
    call_timeout: Duration,
    publish_timeout: Duration,
}

impl AdmissionPipeline {
    pub fn new(
        policies: PolicySet,
        limiters: Arc<RateLimiterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        client: Arc<dyn AccumulationClient>,
        ledger: Arc<dyn FailureLedger>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            policies,
            limiters,
            breakers,
            client,
            ledger,
            publisher,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Upper bound on how long an event publish may hold up the caller.
    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn ledger(&self) -> &Arc<dyn FailureLedger> {
        &self.ledger
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    /// Circuit breaker target name for a partner class.
    pub fn target_for(&self, partner_class: PartnerClass) -> String {
        format!("{}.{}", self.client.name(), partner_class.key())
    }

    /// Run a synchronous accumulation with in-line retries and record the outcome.
    pub async fn accumulate(
        &self,
        command: &AccumulationCommand,
    ) -> Result<Accumulated, AccumulationError> {
        let request = command.validate()?;
        let policy = self.policies.get(request.partner_class);

        self.admit_rate(request.partner_class, policy.rate_limit.wait_timeout)
            .await?;

        let engine = RetryPolicyEngine::new(policy.retry.clone());
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let failure = match self.call(&request, &policy).await {
                CallResult::Completed(receipt) => {
                    return self.record_success(&request, receipt, attempt).await;
                }
                CallResult::CircuitOpen(open) => {
                    warn!(
                        circuit = %open.target,
                        state = %open.state,
                        member_id = %request.member_id,
                        "call rejected by open circuit"
                    );
                    let recorded = self.record_failure(&request, open.to_string()).await;
                    self.notify(EventType::CircuitBreakerOpened, &request).await;
                    recorded?;
                    return Err(AccumulationError::CircuitOpen {
                        target: open.target,
                        state: open.state,
                    });
                }
                CallResult::Failed(failure) => failure,
            };

            match self.classify(&engine, &failure, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying downstream call"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(GiveUpReason::Terminal) => {
                    warn!(error = %failure, member_id = %request.member_id, "downstream rejected request");
                    self.notify(EventType::CircuitBreakerError, &request).await;
                    return Err(AccumulationError::Rejected(failure));
                }
                RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted) => {
                    warn!(
                        attempts = attempt,
                        error = %failure,
                        member_id = %request.member_id,
                        "in-line retries exhausted"
                    );
                    let recorded = self.record_failure(&request, failure.to_string()).await;
                    self.notify(EventType::RetryExhausted, &request).await;
                    recorded?;
                    return Err(AccumulationError::RetriesExhausted {
                        attempts: attempt,
                        source: failure,
                    });
                }
            }
        }
    }

    /// One admission-guarded pass for a ledger record. Nothing is written or published.
    pub async fn reconcile_once(
        &self,
        record: &AccumulationRecord,
        wait_budget: Duration,
    ) -> ReconcileOutcome {
        let request = AccumulationRequest {
            member_id: record.member_id.clone(),
            partner_id: record.partner_id.clone(),
            partner_class: record.partner_class,
            amount: record.amount,
        };
        let policy = self.policies.get(request.partner_class);

        if self.admit_rate(request.partner_class, wait_budget).await.is_err() {
            return ReconcileOutcome::Throttled;
        }

        match self.call(&request, &policy).await {
            CallResult::Completed(receipt) => ReconcileOutcome::Completed(receipt),
            CallResult::CircuitOpen(open) => ReconcileOutcome::CircuitOpen(open),
            CallResult::Failed(failure) => ReconcileOutcome::Failed(failure),
        }
    }

    /// Stage 1: rate-limit admission.
    pub async fn admit_rate(
        &self,
        partner_class: PartnerClass,
        wait_budget: Duration,
    ) -> Result<(), AccumulationError> {
        match self.limiters.try_acquire(partner_class, wait_budget).await {
            Admission::Granted => Ok(()),
            Admission::Throttled => {
                warn!(partner_class = %partner_class, "request throttled");
                Err(AccumulationError::Throttled { partner_class })
            }
        }
    }

    /// Stage 2: circuit breaker admission.
    pub fn admit_circuit(
        &self,
        partner_class: PartnerClass,
        policy: &PartnerPolicy,
    ) -> Result<(Arc<CircuitBreaker>, CallPermit), CircuitOpen> {
        let breaker = self
            .breakers
            .breaker(&self.target_for(partner_class), &policy.circuit_breaker);
        let permit = breaker.try_acquire()?;
        Ok((breaker, permit))
    }

    /// Stage 3: the downstream call under its own deadline.
    pub async fn invoke(
        &self,
        request: &AccumulationRequest,
    ) -> (Result<AccumulationReceipt, DownstreamError>, Duration) {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, self.client.accumulate(request)).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamError::Timeout {
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        };
        (result, started.elapsed())
    }

    /// Stage 4: retry classification.
    pub fn classify(
        &self,
        engine: &RetryPolicyEngine,
        failure: &DownstreamError,
        attempt: u32,
    ) -> RetryDecision {
        engine.decide(FailureKind::Downstream(failure), attempt)
    }

    /// Stages 2 and 3 with the outcome fed back into the breaker.
    pub async fn call(&self, request: &AccumulationRequest, policy: &PartnerPolicy) -> CallResult {
        let (breaker, permit) = match self.admit_circuit(request.partner_class, policy) {
            Ok(admitted) => admitted,
            Err(open) => return CallResult::CircuitOpen(open),
        };

        let (result, elapsed) = self.invoke(request).await;
        let outcome = if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        };
        breaker.record(permit, outcome, elapsed);

        match result {
            Ok(receipt) => CallResult::Completed(receipt),
            Err(failure) => CallResult::Failed(failure),
        }
    }

    async fn record_success(
        &self,
        request: &AccumulationRequest,
        receipt: AccumulationReceipt,
        attempts: u32,
    ) -> Result<Accumulated, AccumulationError> {
        let record = AccumulationRecord::completed(
            request.member_id.clone(),
            request.partner_id.clone(),
            request.partner_class,
            request.amount,
            receipt.points,
        );
        self.save(&record).await?;

        info!(
            record_id = %record.id,
            member_id = %record.member_id,
            points = record.points,
            attempts,
            "accumulation completed"
        );
        Ok(Accumulated {
            transaction_id: receipt.transaction_id,
            attempts,
            record,
        })
    }

    async fn record_failure(
        &self,
        request: &AccumulationRequest,
        message: String,
    ) -> Result<(), AccumulationError> {
        let record = AccumulationRecord::failed(
            request.member_id.clone(),
            request.partner_id.clone(),
            request.partner_class,
            request.amount,
            message,
        );
        self.save(&record).await?;
        debug!(record_id = %record.id, "failure recorded for reconciliation");
        Ok(())
    }

    async fn save(&self, record: &AccumulationRecord) -> Result<(), AccumulationError> {
        if let Err(write_error) = self.ledger.save(record).await {
            error!(
                error = %write_error,
                record_id = %record.id,
                status = %record.status,
                "failed to record accumulation outcome"
            );
            return Err(write_error.into());
        }
        Ok(())
    }

    /// Publish once. Failures are logged and never replace the caller's outcome.
    pub async fn notify(&self, event_type: EventType, request: &AccumulationRequest) {
        let event = LifecycleEvent::new(event_type, request);
        self.publish(&event).await;
    }

    /// Publish under the publish deadline. A stalled bus is logged and abandoned.
    pub async fn publish(&self, event: &LifecycleEvent) {
        match tokio::time::timeout(self.publish_timeout, self.publisher.publish(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(publish_error)) => {
                error!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    error = %publish_error,
                    "failed to publish lifecycle event"
                );
            }
            Err(_) => {
                error!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "lifecycle event publish timed out"
                );
            }
        }
    }
}
