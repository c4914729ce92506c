//! Behavior-driven tests for background reconciliation
//!
//! These tests verify what happens to purchases the gateway could not finish
//! synchronously: how the scheduler re-drives them, when it gives up, and
//! that finished records stay untouched.

use std::time::Duration;

use pointgate_core::{ControlPlane, GatewayConfig};
use pointgate_ledger::{Ledger, LedgerConfig};
use pointgate_tests::*;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn no_inline_retry(partner_class: PartnerClass) -> PartnerPolicy {
    let mut policy = PartnerPolicy::default_for(partner_class);
    policy.retry.max_attempts = 1;
    policy
}

// =============================================================================
// Reconciliation: Recovery
// =============================================================================

#[tokio::test]
async fn when_point_service_recovers_then_failed_purchase_is_completed_by_the_scheduler() {
    // Given: A DuckDB ledger and a point service that fails the first call
    let temp = tempdir().expect("tempdir");
    let ledger = Ledger::open(LedgerConfig::with_home(temp.path())).expect("ledger open");
    let gateway = Gateway::with_ledger(
        ScriptedReply::ok(120),
        [no_inline_retry(PartnerClass::Online)],
        3,
        Arc::new(ledger.clone()),
    );
    gateway.client.push(ScriptedReply::err(server_error()));

    let error = gateway
        .pipeline
        .accumulate(&AccumulationCommand::new("M-5", "P-3", "ONLINE", 12_000))
        .await
        .unwrap_err();
    assert!(matches!(error, AccumulationError::RetriesExhausted { .. }));

    // When: The scheduler runs
    let report = gateway.scheduler.tick().await;

    // Then: The purchase is completed with the points the service granted
    assert_eq!(report.scanned, 1);
    assert_eq!(report.completed, 1);

    let stored = ledger.list(&Default::default()).expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, RecordStatus::Completed);
    assert_eq!(stored[0].points, 120);
    assert_eq!(stored[0].retry_count, 0);
    assert!(stored[0].last_retry_time.is_some());

    // And: Nothing is left to reconcile
    assert!(ledger.find_retryable(3).expect("retryable").is_empty());
}

// =============================================================================
// Reconciliation: Exhaustion
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_reconciliation_keeps_failing_then_record_flips_to_max_retry_exceeded() {
    // Given: A purchase that exhausted in-line retries against a dead service
    let (gateway, ledger) = Gateway::in_memory(ScriptedReply::err(timeout()), [], 3);
    let _ = gateway
        .pipeline
        .accumulate(&AccumulationCommand::new("M-7", "P-1", "MART", 10_000))
        .await;
    let id = ledger.records()[0].id.clone();
    assert_eq!(gateway.publisher.count_of(EventType::RetryExhausted), 1);

    // When: The scheduler retries it three times
    let mut counts = Vec::new();
    for _ in 0..3 {
        make_due(&ledger, &id);
        gateway.scheduler.tick().await;
        counts.push(ledger.get(&id).expect("stored").retry_count);
    }

    // Then: The retry count rose to the maximum and the record is terminal
    assert_eq!(counts, vec![1, 2, 3]);
    let record = ledger.get(&id).expect("stored");
    assert_eq!(record.status, RecordStatus::MaxRetryExceeded);

    // And: A second exhaustion event announces the dead letter
    assert_eq!(gateway.publisher.count_of(EventType::RetryExhausted), 2);

    // And: Further ticks leave it alone
    make_due(&ledger, &id);
    let calls = gateway.client.calls();
    let report = gateway.scheduler.tick().await;
    assert_eq!(report.scanned, 0);
    assert_eq!(gateway.client.calls(), calls);
}

#[tokio::test]
async fn when_record_was_attempted_recently_then_scheduler_waits_for_its_backoff() {
    // Given: A record reconciled moments ago
    let (gateway, ledger) = Gateway::in_memory(ScriptedReply::ok(1), [], 3);
    let mut record =
        AccumulationRecord::failed("M-1", "P-1", PartnerClass::Convenience, 700, "timeout");
    record
        .record_retry_failure("503", time::OffsetDateTime::now_utc(), 3, false)
        .expect("open record");
    ledger.insert(record.clone());

    // When: The scheduler ticks immediately
    let report = gateway.scheduler.tick().await;

    // Then: The record is skipped until its backoff elapses
    assert_eq!(report.not_due, 1);
    assert_eq!(gateway.client.calls(), 0);
    assert_eq!(ledger.get(&record.id), Some(record));
}

// =============================================================================
// Reconciliation: Shared Resilience State
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_breaker_is_open_then_scheduler_defers_without_spending_retries() {
    // Given: An open mart breaker and a failed record waiting
    let (gateway, ledger) = Gateway::in_memory(
        ScriptedReply::err(server_error()),
        [no_inline_retry(PartnerClass::Mart)],
        3,
    );
    for index in 0..10 {
        let _ = gateway
            .pipeline
            .accumulate(&AccumulationCommand::new(format!("M-{index}"), "P-1", "MART", 100))
            .await;
    }
    assert_eq!(
        gateway.breaker(PartnerClass::Mart).map(|breaker| breaker.state()),
        Some(CircuitState::Open)
    );

    // When: The scheduler ticks while the breaker is open
    let calls = gateway.client.calls();
    let report = gateway.scheduler.tick().await;

    // Then: Every record is deferred and none lost a retry
    assert_eq!(report.deferred, 10);
    assert_eq!(gateway.client.calls(), calls);
    assert!(ledger
        .records()
        .iter()
        .all(|record| record.retry_count == 0 && record.status == RecordStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn when_scheduler_is_cancelled_then_its_task_stops() {
    // Given: A running scheduler with nothing to do
    let (gateway, _ledger) = Gateway::in_memory(ScriptedReply::ok(1), [], 3);
    let cancel = CancellationToken::new();
    let handle = Arc::clone(&gateway.scheduler).spawn(cancel.clone());

    // When: It is cancelled after a few intervals
    tokio::time::sleep(Duration::from_secs(95)).await;
    cancel.cancel();

    // Then: The task finishes promptly
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler stopped")
        .expect("scheduler task");
}

// =============================================================================
// Reconciliation: Configured Control Plane
// =============================================================================

#[tokio::test]
async fn when_gateway_is_built_from_config_then_reconcile_uses_the_configured_ledger() {
    // Given: A control plane in mock mode with a ledger path from configuration
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("points").join("ledger.duckdb");
    let mut config = GatewayConfig::from_yaml("scheduler:\n  max_retry_count: 2\n").expect("yaml");
    config.ledger.path = Some(db_path.clone());
    let plane = ControlPlane::from_config(config, true).await.expect("control plane");

    // And: A failed purchase already sits in the ledger
    let failed = AccumulationRecord::failed("M-9", "P-2", PartnerClass::Mart, 4_200, "timeout");
    plane.ledger().save(&failed).expect("seed");

    // When: One reconciliation pass runs
    let report = plane.scheduler().tick().await;

    // Then: The mock service completes it in the configured database
    assert_eq!(report.completed, 1);
    assert!(db_path.exists());
    let stored = plane.ledger().find(&failed.id).expect("find").expect("stored");
    assert_eq!(stored.status, RecordStatus::Completed);
    assert_eq!(stored.points, 42);
    assert_eq!(plane.scheduler().settings().max_retry_count, 2);
}
