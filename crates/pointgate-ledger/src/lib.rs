//! # Pointgate Ledger
//!
//! DuckDB-backed failure-history ledger for point accumulation attempts.
//!
//! ## Overview
//!
//! Every accumulation the gateway could not finish synchronously lands here,
//! together with the successes it completed. The retry scheduler reads the
//! ledger to find records that still deserve another attempt.
//!
//! - 🔒 **Parameterized SQL**: member and partner identifiers never reach SQL text
//! - 🔄 **Connection pooling**: one database instance, cloned connections
//! - 🧾 **Atomic upserts**: each save is its own transaction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pointgate_ledger::{AccumulationRecord, Ledger, PartnerClass};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = Ledger::open_default()?;
//!
//!     let mut record = AccumulationRecord::new("M-1", "P-1", PartnerClass::Mart, 10_000);
//!     record.fail("downstream timeout")?;
//!     ledger.save(&record)?;
//!
//!     let retryable = ledger.find_retryable(3)?;
//!     println!("{} record(s) awaiting reconciliation", retryable.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `accumulation_records` | One row per accumulation attempt |
//! | `schema_migrations` | Applied schema versions |

pub mod duckdb;
pub mod migrations;
mod models;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{Connection, Row, ToSql};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

pub use duckdb::{DuckDbConnectionManager, PooledConnection};
pub use models::{
    AccumulationRecord, PartnerClass, RecordStatus, TerminalRecord, UnknownPartnerClass,
    UnknownRecordStatus,
};

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored row could not be mapped back to a record.
    #[error("invalid ledger row '{id}': {reason}")]
    InvalidRow { id: String, reason: String },

    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Configuration for the ledger database.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Root directory for pointgate data.
    pub pointgate_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let pointgate_home = resolve_pointgate_home();
        let db_path = pointgate_home.join("ledger.duckdb");
        Self {
            pointgate_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl LedgerConfig {
    /// Configuration rooted at `home`, with the database in its default place.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let pointgate_home = home.into();
        let db_path = pointgate_home.join("ledger.duckdb");
        Self {
            pointgate_home,
            db_path,
            ..Self::default()
        }
    }
}

/// Query options for [`Ledger::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<RecordStatus>,
    pub member_id: Option<String>,
    /// Zero means no limit.
    pub limit: usize,
}

/// The failure-history store.
#[derive(Clone)]
pub struct Ledger {
    config: LedgerConfig,
    manager: DuckDbConnectionManager,
}

const RECORD_COLUMNS: &str = "id, member_id, partner_id, partner_class, amount, points, status, \
     retry_count, error_message, transaction_time, last_retry_time";

impl Ledger {
    /// Open a ledger with default configuration.
    pub fn open_default() -> Result<Self, LedgerError> {
        Self::open(LedgerConfig::default())
    }

    /// Open a ledger, creating the database file and schema when missing.
    pub fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let ledger = Self { config, manager };
        ledger.initialize()?;
        Ok(ledger)
    }

    pub fn initialize(&self) -> Result<(), LedgerError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Upsert a record keyed by its identity.
    ///
    /// The write is atomic: either every column lands or none does.
    pub fn save(&self, record: &AccumulationRecord) -> Result<(), LedgerError> {
        let transaction_time = format_timestamp(record.transaction_time)?;
        let last_retry_time = record
            .last_retry_time
            .map(format_timestamp)
            .transpose()?;
        let partner_class = record.partner_class.as_str();
        let status = record.status.as_str();
        let retry_count = i64::from(record.retry_count);

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), LedgerError> {
            let existing: i64 = connection.query_row(
                "SELECT COUNT(*) FROM accumulation_records WHERE id = ?",
                [record.id.as_str()],
                |row| row.get(0),
            )?;

            if existing == 0 {
                let params: [&dyn ToSql; 11] = [
                    &record.id,
                    &record.member_id,
                    &record.partner_id,
                    &partner_class,
                    &record.amount,
                    &record.points,
                    &status,
                    &retry_count,
                    &record.error_message,
                    &transaction_time,
                    &last_retry_time,
                ];
                connection.execute(
                    "INSERT INTO accumulation_records \
                     (id, member_id, partner_id, partner_class, amount, points, status, \
                      retry_count, error_message, transaction_time, last_retry_time, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
                    params.as_slice(),
                )?;
            } else {
                let params: [&dyn ToSql; 10] = [
                    &record.partner_id,
                    &partner_class,
                    &record.amount,
                    &record.points,
                    &status,
                    &retry_count,
                    &record.error_message,
                    &transaction_time,
                    &last_retry_time,
                    &record.id,
                ];
                connection.execute(
                    "UPDATE accumulation_records SET \
                     partner_id = ?, partner_class = ?, amount = ?, points = ?, status = ?, \
                     retry_count = ?, error_message = ?, transaction_time = ?, \
                     last_retry_time = ?, updated_at = CURRENT_TIMESTAMP \
                     WHERE id = ?",
                    params.as_slice(),
                )?;
            }
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    /// Fetch one record by identity.
    pub fn find(&self, id: &str) -> Result<Option<AccumulationRecord>, LedgerError> {
        let connection = self.manager.acquire()?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM accumulation_records WHERE id = ?");
        let params: [&dyn ToSql; 1] = [&id];
        let mut records = query_records(&connection, sql.as_str(), params.as_slice())?;
        Ok(records.pop())
    }

    /// `FAILED` records whose retry count is still below `max_retry_count`, oldest first.
    pub fn find_retryable(
        &self,
        max_retry_count: u32,
    ) -> Result<Vec<AccumulationRecord>, LedgerError> {
        self.find_by_status(RecordStatus::Failed, max_retry_count)
    }

    /// Records in `status` with fewer than `max_retry_count` retries, oldest first.
    pub fn find_by_status(
        &self,
        status: RecordStatus,
        max_retry_count: u32,
    ) -> Result<Vec<AccumulationRecord>, LedgerError> {
        let connection = self.manager.acquire()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM accumulation_records \
             WHERE status = ? AND retry_count < ? \
             ORDER BY transaction_time, id"
        );
        let status = status.as_str();
        let max_retry_count = i64::from(max_retry_count);
        let params: [&dyn ToSql; 2] = [&status, &max_retry_count];
        query_records(&connection, sql.as_str(), params.as_slice())
    }

    /// Filtered listing, newest first.
    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<AccumulationRecord>, LedgerError> {
        let status = filter.status.map(RecordStatus::as_str);
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM accumulation_records WHERE 1 = 1");
        let mut params: Vec<&dyn ToSql> = Vec::new();
        if let Some(status) = status.as_ref() {
            sql.push_str(" AND status = ?");
            params.push(status);
        }
        if let Some(member_id) = filter.member_id.as_ref() {
            sql.push_str(" AND member_id = ?");
            params.push(member_id);
        }
        sql.push_str(" ORDER BY transaction_time DESC, id");
        if filter.limit > 0 {
            sql.push_str(" LIMIT ?");
            params.push(&limit);
        }

        let connection = self.manager.acquire()?;
        query_records(&connection, sql.as_str(), params.as_slice())
    }

    /// Record count per status. Every status is present, possibly with zero.
    pub fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>, LedgerError> {
        let mut counts: BTreeMap<RecordStatus, u64> =
            RecordStatus::ALL.into_iter().map(|status| (status, 0)).collect();

        let connection = self.manager.acquire()?;
        let mut statement = connection
            .prepare("SELECT status, COUNT(*) FROM accumulation_records GROUP BY status")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            let status = status
                .parse::<RecordStatus>()
                .map_err(|error| LedgerError::InvalidRow {
                    id: String::from("<status_counts>"),
                    reason: error.to_string(),
                })?;
            counts.insert(status, u64::try_from(count).unwrap_or(0));
        }

        Ok(counts)
    }
}

struct RawRecord {
    id: String,
    member_id: String,
    partner_id: String,
    partner_class: String,
    amount: i64,
    points: i64,
    status: String,
    retry_count: i64,
    error_message: Option<String>,
    transaction_time: String,
    last_retry_time: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, ::duckdb::Error> {
        Ok(Self {
            id: row.get(0)?,
            member_id: row.get(1)?,
            partner_id: row.get(2)?,
            partner_class: row.get(3)?,
            amount: row.get(4)?,
            points: row.get(5)?,
            status: row.get(6)?,
            retry_count: row.get(7)?,
            error_message: row.get(8)?,
            transaction_time: row.get(9)?,
            last_retry_time: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<AccumulationRecord, LedgerError> {
        let invalid = |reason: String| LedgerError::InvalidRow {
            id: self.id.clone(),
            reason,
        };

        let partner_class = self
            .partner_class
            .parse::<PartnerClass>()
            .map_err(|error| invalid(error.to_string()))?;
        let status = self
            .status
            .parse::<RecordStatus>()
            .map_err(|error| invalid(error.to_string()))?;
        let retry_count =
            u32::try_from(self.retry_count).map_err(|error| invalid(error.to_string()))?;
        let transaction_time =
            parse_timestamp(&self.transaction_time).map_err(|error| invalid(error.to_string()))?;
        let last_retry_time = self
            .last_retry_time
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|error| invalid(error.to_string()))?;

        Ok(AccumulationRecord {
            id: self.id,
            member_id: self.member_id,
            partner_id: self.partner_id,
            partner_class,
            amount: self.amount,
            points: self.points,
            status,
            retry_count,
            error_message: self.error_message,
            transaction_time,
            last_retry_time,
        })
    }
}

fn query_records(
    connection: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<AccumulationRecord>, LedgerError> {
    let mut statement = connection.prepare(sql)?;
    let rows = statement.query_map(params, RawRecord::from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn format_timestamp(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(&Rfc3339)
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &Rfc3339)
}

/// Resolve the pointgate home directory from environment or default.
fn resolve_pointgate_home() -> PathBuf {
    if let Some(path) = env::var_os("POINTGATE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".pointgate");
    }

    PathBuf::from(".pointgate")
}
