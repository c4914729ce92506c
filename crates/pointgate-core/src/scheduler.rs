//! Background reconciliation of failed accumulations.
//!
//! Each tick reads retryable records from the ledger and re-drives them through
//! the admission pipeline, sharing its rate limiters and circuit breakers with
//! live traffic. Records that are throttled or hit an open circuit are left
//! untouched for a later tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pointgate_ledger::{AccumulationRecord, RecordStatus};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventType, LifecycleEvent};
use crate::pipeline::{AdmissionPipeline, ReconcileOutcome};
use crate::retry::RetryPolicyEngine;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Reconciliation attempts allowed per record. The synchronous attempt is not counted.
    pub max_retry_count: u32,
    /// Records re-driven in parallel within one tick.
    pub concurrency: usize,
    /// How long a record may wait for a rate-limit permit before being deferred.
    pub wait_budget: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            concurrency: 8,
            wait_budget: Duration::ZERO,
        }
    }
}

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Another tick was still running; nothing was done.
    pub skipped: bool,
    pub scanned: usize,
    pub completed: usize,
    /// Failed again but still retryable.
    pub failed: usize,
    pub exhausted: usize,
    /// Throttled or rejected by an open circuit. Not charged against the retry budget.
    pub deferred: usize,
    /// Backoff since the last attempt has not elapsed yet.
    pub not_due: usize,
    pub ledger_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordResult {
    Completed,
    Failed,
    Exhausted,
    Deferred,
    NotDue,
    LedgerError,
}

impl TickReport {
    fn count(&mut self, result: RecordResult) {
        match result {
            RecordResult::Completed => self.completed += 1,
            RecordResult::Failed => self.failed += 1,
            RecordResult::Exhausted => self.exhausted += 1,
            RecordResult::Deferred => self.deferred += 1,
            RecordResult::NotDue => self.not_due += 1,
            RecordResult::LedgerError => self.ledger_errors += 1,
        }
    }
}

pub struct RetryScheduler {
    pipeline: Arc<AdmissionPipeline>,
    settings: SchedulerSettings,
    in_progress: AtomicBool,
}

/// Clears the in-progress flag even if the tick future is dropped.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryScheduler {
    pub fn new(pipeline: Arc<AdmissionPipeline>, settings: SchedulerSettings) -> Self {
        Self {
            pipeline,
            settings,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_ticking(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one reconciliation pass. Returns a skipped report if a tick is already running.
    pub async fn tick(&self) -> TickReport {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("reconciliation tick still running, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        }
        let _guard = TickGuard(&self.in_progress);

        let mut report = TickReport::default();
        let records = match self
            .pipeline
            .ledger()
            .find_retryable(self.settings.max_retry_count)
            .await
        {
            Ok(records) => records,
            Err(ledger_error) => {
                error!(error = %ledger_error, "failed to load retryable records");
                report.ledger_errors += 1;
                return report;
            }
        };

        let mut seen = HashSet::new();
        let records: Vec<AccumulationRecord> = records
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .collect();
        report.scanned = records.len();

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for record in records {
            let pipeline = Arc::clone(&self.pipeline);
            let permits = Arc::clone(&permits);
            let settings = self.settings.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return RecordResult::Deferred;
                };
                reconcile_record(&pipeline, record, &settings).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => report.count(result),
                Err(join_error) => {
                    error!(error = %join_error, "reconciliation task failed");
                    report.ledger_errors += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            failed = report.failed,
            exhausted = report.exhausted,
            deferred = report.deferred,
            not_due = report.not_due,
            ledger_errors = report.ledger_errors,
            "reconciliation tick finished"
        );
        report
    }

    /// Tick every `interval` until `cancel` fires. Missed ticks are skipped, not bunched.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                max_retry_count = self.settings.max_retry_count,
                "retry scheduler started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                self.tick().await;
            }

            info!("retry scheduler stopped");
        })
    }
}

async fn reconcile_record(
    pipeline: &AdmissionPipeline,
    mut record: AccumulationRecord,
    settings: &SchedulerSettings,
) -> RecordResult {
    if record.status != RecordStatus::Failed || !record.is_retryable(settings.max_retry_count) {
        return RecordResult::NotDue;
    }

    let now = OffsetDateTime::now_utc();
    let policy = pipeline.policies().get(record.partner_class);
    if let Some(last_retry_time) = record.last_retry_time {
        let engine = RetryPolicyEngine::new(policy.retry.clone());
        let due = last_retry_time + engine.reconcile_delay(record.retry_count);
        if now < due {
            debug!(record_id = %record.id, "record not yet due for reconciliation");
            return RecordResult::NotDue;
        }
    }

    let result = match pipeline.reconcile_once(&record, settings.wait_budget).await {
        ReconcileOutcome::Completed(receipt) => {
            if let Err(terminal) = record.complete(receipt.points, now) {
                warn!(record_id = %terminal.id, status = %terminal.status, "record already terminal");
                return RecordResult::NotDue;
            }
            info!(record_id = %record.id, points = record.points, "reconciliation completed");
            RecordResult::Completed
        }
        ReconcileOutcome::Throttled => return RecordResult::Deferred,
        ReconcileOutcome::CircuitOpen(open) => {
            debug!(record_id = %record.id, circuit = %open.target, "circuit open, deferring");
            return RecordResult::Deferred;
        }
        ReconcileOutcome::Failed(failure) => {
            let give_up = !failure.retryable();
            let status = match record.record_retry_failure(
                failure.to_string(),
                now,
                settings.max_retry_count,
                give_up,
            ) {
                Ok(status) => status,
                Err(terminal) => {
                    warn!(record_id = %terminal.id, status = %terminal.status, "record already terminal");
                    return RecordResult::NotDue;
                }
            };

            if status == RecordStatus::MaxRetryExceeded {
                warn!(
                    record_id = %record.id,
                    retry_count = record.retry_count,
                    error = %failure,
                    "reconciliation exhausted"
                );
                RecordResult::Exhausted
            } else {
                debug!(record_id = %record.id, retry_count = record.retry_count, "reconciliation failed");
                RecordResult::Failed
            }
        }
    };

    let saved = pipeline.ledger().save(&record).await;
    if result == RecordResult::Exhausted {
        pipeline
            .publish(&LifecycleEvent::for_record(EventType::RetryExhausted, &record))
            .await;
    }

    match saved {
        Ok(()) => result,
        Err(ledger_error) => {
            error!(record_id = %record.id, error = %ledger_error, "failed to save reconciled record");
            RecordResult::LedgerError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::downstream::{DownstreamError, ScriptedAccumulationClient, ScriptedReply};
    use crate::events::{EventPublisher, PublishFuture, RecordingEventPublisher};
    use crate::ledger::{FailureLedger, InMemoryLedger, LedgerFuture};
    use crate::policy::{PartnerPolicy, PolicySet};
    use crate::rate_limiter::RateLimiterRegistry;
    use pointgate_ledger::PartnerClass;

    struct Harness {
        scheduler: Arc<RetryScheduler>,
        client: Arc<ScriptedAccumulationClient>,
        ledger: Arc<InMemoryLedger>,
        publisher: Arc<RecordingEventPublisher>,
    }

    fn harness(fallback: ScriptedReply, policy: PartnerPolicy, max_retry_count: u32) -> Harness {
        let policies = PolicySet::new([policy]);
        let client = Arc::new(ScriptedAccumulationClient::new(fallback));
        let ledger = Arc::new(InMemoryLedger::new());
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
            pipeline,
            SchedulerSettings {
                max_retry_count,
                ..SchedulerSettings::default()
            },
        ));
        Harness {
            scheduler,
            client,
            ledger,
            publisher,
        }
    }

    fn failed_record(member_id: &str) -> AccumulationRecord {
        AccumulationRecord::failed(member_id, "P-1", PartnerClass::Mart, 3_000, "timeout")
    }

    fn server_error() -> DownstreamError {
        DownstreamError::from_status(503, "unavailable")
    }

    #[tokio::test]
    async fn success_completes_record() {
        let h = harness(ScriptedReply::ok(30), PartnerPolicy::mart_default(), 3);
        let record = failed_record("M-1");
        h.ledger.insert(record.clone());

        let report = h.scheduler.tick().await;

        assert_eq!(report.scanned, 1);
        assert_eq!(report.completed, 1);
        let stored = h.ledger.get(&record.id).expect("stored");
        assert_eq!(stored.status, RecordStatus::Completed);
        assert_eq!(stored.points, 30);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn retryable_failure_increments_until_exhausted() {
        let h = harness(ScriptedReply::err(server_error()), PartnerPolicy::mart_default(), 2);
        let record = failed_record("M-1");
        h.ledger.insert(record.clone());

        let first = h.scheduler.tick().await;
        assert_eq!(first.failed, 1);
        let stored = h.ledger.get(&record.id).expect("stored");
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, RecordStatus::Failed);
        assert!(stored.last_retry_time.is_some());

        let mut due = stored;
        due.last_retry_time = Some(OffsetDateTime::now_utc() - time::Duration::minutes(1));
        h.ledger.insert(due);

        let second = h.scheduler.tick().await;
        assert_eq!(second.exhausted, 1);
        let stored = h.ledger.get(&record.id).expect("stored");
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.status, RecordStatus::MaxRetryExceeded);
        assert_eq!(h.publisher.count_of(EventType::RetryExhausted), 1);
    }

    #[tokio::test]
    async fn records_inside_backoff_are_not_due() {
        let h = harness(ScriptedReply::ok(1), PartnerPolicy::mart_default(), 3);
        let mut record = failed_record("M-1");
        record.retry_count = 1;
        record.last_retry_time = Some(OffsetDateTime::now_utc());
        h.ledger.insert(record);

        let report = h.scheduler.tick().await;

        assert_eq!(report.not_due, 1);
        assert_eq!(h.client.calls(), 0);
    }

    #[tokio::test]
    async fn terminal_rejection_exhausts_immediately() {
        let h = harness(
            ScriptedReply::err(DownstreamError::from_status(404, "no member")),
            PartnerPolicy::mart_default(),
            5,
        );
        let record = failed_record("M-1");
        h.ledger.insert(record.clone());

        let report = h.scheduler.tick().await;

        assert_eq!(report.exhausted, 1);
        let stored = h.ledger.get(&record.id).expect("stored");
        assert_eq!(stored.status, RecordStatus::MaxRetryExceeded);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn throttled_records_are_deferred_untouched() {
        let mut policy = PartnerPolicy::mart_default();
        policy.rate_limit.permits = 1;
        let h = harness(ScriptedReply::err(server_error()), policy, 3);
        let first = failed_record("M-1");
        let second = failed_record("M-2");
        h.ledger.insert(first.clone());
        h.ledger.insert(second.clone());

        let report = h.scheduler.tick().await;

        assert_eq!(report.failed + report.deferred, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.client.calls(), 1);
        let untouched = [first, second]
            .iter()
            .filter_map(|record| h.ledger.get(&record.id))
            .filter(|record| record.retry_count == 0)
            .count();
        assert_eq!(untouched, 1);
    }

    #[tokio::test]
    async fn terminal_records_are_ignored() {
        let h = harness(ScriptedReply::ok(1), PartnerPolicy::mart_default(), 3);
        let mut done = failed_record("M-1");
        done.complete(10, OffsetDateTime::now_utc()).expect("complete");
        let mut spent = failed_record("M-2");
        spent
            .record_retry_failure("503", OffsetDateTime::now_utc(), 1, false)
            .expect("open");
        h.ledger.insert(done.clone());
        h.ledger.insert(spent.clone());

        let report = h.scheduler.tick().await;

        assert_eq!(report.scanned, 0);
        assert_eq!(h.client.calls(), 0);
        assert_eq!(h.ledger.get(&done.id), Some(done));
        assert_eq!(h.ledger.get(&spent.id), Some(spent));
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let h = harness(
            ScriptedReply::ok(1).after(Duration::from_millis(200)),
            PartnerPolicy::mart_default(),
            3,
        );
        h.ledger.insert(failed_record("M-1"));

        let running = {
            let scheduler = Arc::clone(&h.scheduler);
            tokio::spawn(async move { scheduler.tick().await })
        };
        while !h.scheduler.is_ticking() {
            tokio::task::yield_now().await;
        }

        let overlapping = h.scheduler.tick().await;
        let finished = running.await.expect("tick task");

        assert!(overlapping.skipped);
        assert_eq!(finished.completed, 1);
        assert!(!h.scheduler.is_ticking());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_scheduler_stops_on_cancel() {
        let h = harness(ScriptedReply::ok(5), PartnerPolicy::mart_default(), 3);
        let record = failed_record("M-1");
        h.ledger.insert(record.clone());

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&h.scheduler).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.expect("scheduler task");

        assert_eq!(
            h.ledger.get(&record.id).map(|record| record.status),
            Some(RecordStatus::Completed)
        );
    }

    /// Reports every retryable record twice, like overlapping query pages.
    struct DuplicatingLedger(Arc<InMemoryLedger>);

    impl FailureLedger for DuplicatingLedger {
        fn save<'a>(&'a self, record: &'a AccumulationRecord) -> LedgerFuture<'a, ()> {
            self.0.save(record)
        }

        fn find_retryable(&self, max_retry_count: u32) -> LedgerFuture<'_, Vec<AccumulationRecord>> {
            Box::pin(async move {
                let records = self.0.find_retryable(max_retry_count).await?;
                Ok(records.iter().chain(records.iter()).cloned().collect())
            })
        }

        fn find<'a>(&'a self, id: &'a str) -> LedgerFuture<'a, Option<AccumulationRecord>> {
            self.0.find(id)
        }
    }

    struct StalledPublisher;

    impl EventPublisher for StalledPublisher {
        fn publish<'a>(&'a self, _event: &'a LifecycleEvent) -> PublishFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    fn scheduler_over(
        client: Arc<ScriptedAccumulationClient>,
        ledger: Arc<dyn FailureLedger>,
        publisher: Arc<dyn EventPublisher>,
        max_retry_count: u32,
    ) -> RetryScheduler {
        let policies = PolicySet::new([PartnerPolicy::mart_default()]);
        let pipeline = AdmissionPipeline::new(
            policies.clone(),
            Arc::new(RateLimiterRegistry::new(&policies)),
            Arc::new(CircuitBreakerRegistry::new()),
            client,
            ledger,
            publisher,
        )
        .with_publish_timeout(Duration::from_millis(100));
        RetryScheduler::new(
            Arc::new(pipeline),
            SchedulerSettings {
                max_retry_count,
                ..SchedulerSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn duplicate_rows_are_reconciled_once_per_tick() {
        let store = Arc::new(InMemoryLedger::new());
        let record = failed_record("M-1");
        store.insert(record.clone());
        let client = Arc::new(ScriptedAccumulationClient::new(ScriptedReply::ok(12)));
        let scheduler = scheduler_over(
            client.clone(),
            Arc::new(DuplicatingLedger(store.clone())),
            Arc::new(RecordingEventPublisher::new()),
            3,
        );

        let report = scheduler.tick().await;

        assert_eq!(report.scanned, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(client.calls(), 1);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_event_bus_does_not_lose_exhausted_record() {
        let store = Arc::new(InMemoryLedger::new());
        let record = failed_record("M-1");
        store.insert(record.clone());
        let client = Arc::new(ScriptedAccumulationClient::new(ScriptedReply::err(server_error())));
        let scheduler = scheduler_over(client, store.clone(), Arc::new(StalledPublisher), 1);

        let report = tokio::time::timeout(Duration::from_secs(3600), scheduler.tick())
            .await
            .expect("tick not blocked by event bus");

        assert_eq!(report.exhausted, 1);
        assert_eq!(
            store.get(&record.id).map(|record| record.status),
            Some(RecordStatus::MaxRetryExceeded)
        );
    }
}
