//! Async access to the failure-history ledger.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use pointgate_ledger::{AccumulationRecord, Ledger, LedgerError, RecordStatus};

pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Durable record store shared by the pipeline and the scheduler.
pub trait FailureLedger: Send + Sync {
    /// Upsert by record id. Returns once the write is durable.
    fn save<'a>(&'a self, record: &'a AccumulationRecord) -> LedgerFuture<'a, ()>;

    /// `FAILED` records with fewer than `max_retry_count` retries.
    fn find_retryable(&self, max_retry_count: u32) -> LedgerFuture<'_, Vec<AccumulationRecord>>;

    fn find<'a>(&'a self, id: &'a str) -> LedgerFuture<'a, Option<AccumulationRecord>>;
}

impl FailureLedger for Ledger {
    fn save<'a>(&'a self, record: &'a AccumulationRecord) -> LedgerFuture<'a, ()> {
        let ledger = self.clone();
        let record = record.clone();
        Box::pin(blocking(move || ledger.save(&record)))
    }

    fn find_retryable(&self, max_retry_count: u32) -> LedgerFuture<'_, Vec<AccumulationRecord>> {
        let ledger = self.clone();
        Box::pin(blocking(move || ledger.find_retryable(max_retry_count)))
    }

    fn find<'a>(&'a self, id: &'a str) -> LedgerFuture<'a, Option<AccumulationRecord>> {
        let ledger = self.clone();
        let id = id.to_owned();
        Box::pin(blocking(move || ledger.find(&id)))
    }
}

/// Run DuckDB work on the blocking pool so request tasks never stall the runtime.
async fn blocking<T, F>(work: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| LedgerError::Io(std::io::Error::other(error)))?
}

/// Volatile ledger for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<BTreeMap<String, AccumulationRecord>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn insert(&self, record: AccumulationRecord) {
        self.records.lock().insert(record.id.clone(), record);
    }

    pub fn records(&self) -> Vec<AccumulationRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<AccumulationRecord> {
        self.records.lock().get(id).cloned()
    }

    /// Successful save calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl FailureLedger for InMemoryLedger {
    fn save<'a>(&'a self, record: &'a AccumulationRecord) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Io(std::io::Error::other("ledger unavailable")));
            }
            self.insert(record.clone());
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn find_retryable(&self, max_retry_count: u32) -> LedgerFuture<'_, Vec<AccumulationRecord>> {
        Box::pin(async move {
            let mut records: Vec<AccumulationRecord> = self
                .records
                .lock()
                .values()
                .filter(|record| {
                    record.status == RecordStatus::Failed && record.retry_count < max_retry_count
                })
                .cloned()
                .collect();
            records.sort_by(|left, right| {
                left.transaction_time
                    .cmp(&right.transaction_time)
                    .then_with(|| left.id.cmp(&right.id))
            });
            Ok(records)
        })
    }

    fn find<'a>(&'a self, id: &'a str) -> LedgerFuture<'a, Option<AccumulationRecord>> {
        Box::pin(async move { Ok(self.get(id)) })
    }
}
