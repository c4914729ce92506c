//! Persisted accumulation record model and its status transitions.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Fixed partner categories that select a policy bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartnerClass {
    Mart,
    Convenience,
    Online,
}

impl PartnerClass {
    pub const ALL: [Self; 3] = [Self::Mart, Self::Convenience, Self::Online];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mart => "MART",
            Self::Convenience => "CONVENIENCE",
            Self::Online => "ONLINE",
        }
    }

    /// Lowercase key used in configuration files and limiter names.
    pub const fn key(self) -> &'static str {
        match self {
            Self::Mart => "mart",
            Self::Convenience => "convenience",
            Self::Online => "online",
        }
    }
}

impl Display for PartnerClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a partner class string matches none of the known classes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid partner class '{value}', expected one of MART, CONVENIENCE, ONLINE")]
pub struct UnknownPartnerClass {
    pub value: String,
}

impl FromStr for PartnerClass {
    type Err = UnknownPartnerClass;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MART" => Ok(Self::Mart),
            "CONVENIENCE" => Ok(Self::Convenience),
            "ONLINE" => Ok(Self::Online),
            _ => Err(UnknownPartnerClass {
                value: value.to_owned(),
            }),
        }
    }
}

/// Lifecycle status of an accumulation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
    MaxRetryExceeded,
}

impl RecordStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Completed,
        Self::Failed,
        Self::MaxRetryExceeded,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::MaxRetryExceeded => "MAX_RETRY_EXCEEDED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::MaxRetryExceeded)
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid record status '{value}'")]
pub struct UnknownRecordStatus {
    pub value: String,
}

impl FromStr for RecordStatus {
    type Err = UnknownRecordStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "MAX_RETRY_EXCEEDED" => Ok(Self::MaxRetryExceeded),
            _ => Err(UnknownRecordStatus {
                value: value.to_owned(),
            }),
        }
    }
}

/// A status change was requested on a record that already reached a terminal state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("record {id} is {status} and cannot change state")]
pub struct TerminalRecord {
    pub id: String,
    pub status: RecordStatus,
}

/// One accumulation attempt and its retry history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulationRecord {
    pub id: String,
    pub member_id: String,
    pub partner_id: String,
    pub partner_class: PartnerClass,
    /// Requested amount in minor currency units.
    pub amount: i64,
    pub points: i64,
    pub status: RecordStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub transaction_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_retry_time: Option<OffsetDateTime>,
}

impl AccumulationRecord {
    /// Create a `PENDING` record with a fresh identity.
    pub fn new(
        member_id: impl Into<String>,
        partner_id: impl Into<String>,
        partner_class: PartnerClass,
        amount: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            member_id: member_id.into(),
            partner_id: partner_id.into(),
            partner_class,
            amount,
            points: 0,
            status: RecordStatus::Pending,
            retry_count: 0,
            error_message: None,
            transaction_time: OffsetDateTime::now_utc(),
            last_retry_time: None,
        }
    }

    /// A record for an accumulation that succeeded on the synchronous path.
    pub fn completed(
        member_id: impl Into<String>,
        partner_id: impl Into<String>,
        partner_class: PartnerClass,
        amount: i64,
        points: i64,
    ) -> Self {
        Self {
            points,
            status: RecordStatus::Completed,
            ..Self::new(member_id, partner_id, partner_class, amount)
        }
    }

    /// A record for an accumulation that failed on the synchronous path.
    pub fn failed(
        member_id: impl Into<String>,
        partner_id: impl Into<String>,
        partner_class: PartnerClass,
        amount: i64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: RecordStatus::Failed,
            error_message: Some(error.into()),
            ..Self::new(member_id, partner_id, partner_class, amount)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether reconciliation may still pick this record up.
    pub fn is_retryable(&self, max_retry_count: u32) -> bool {
        self.status == RecordStatus::Failed && self.retry_count < max_retry_count
    }

    /// Mark the accumulation as done. A re-driven record also gets its retry timestamp.
    pub fn complete(&mut self, points: i64, at: OffsetDateTime) -> Result<(), TerminalRecord> {
        self.ensure_open()?;
        if self.status == RecordStatus::Failed {
            self.last_retry_time = Some(at);
        }
        self.points = points;
        self.status = RecordStatus::Completed;
        Ok(())
    }

    /// First failure of the synchronous path. The retry count stays at its baseline.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TerminalRecord> {
        self.ensure_open()?;
        self.status = RecordStatus::Failed;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Register a failed reconciliation attempt and return the resulting status.
    ///
    /// `give_up` forces exhaustion regardless of the remaining budget, for
    /// failures that can never succeed on a later attempt.
    pub fn record_retry_failure(
        &mut self,
        error: impl Into<String>,
        at: OffsetDateTime,
        max_retry_count: u32,
        give_up: bool,
    ) -> Result<RecordStatus, TerminalRecord> {
        self.ensure_open()?;
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_retry_time = Some(at);
        self.error_message = Some(error.into());
        self.status = if give_up || self.retry_count >= max_retry_count {
            RecordStatus::MaxRetryExceeded
        } else {
            RecordStatus::Failed
        };
        Ok(self.status)
    }

    fn ensure_open(&self) -> Result<(), TerminalRecord> {
        if self.is_terminal() {
            return Err(TerminalRecord {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_record() -> AccumulationRecord {
        let mut record = AccumulationRecord::new("M-100", "P-7", PartnerClass::Mart, 12_000);
        record.fail("downstream timeout").expect("pending record can fail");
        record
    }

    #[test]
    fn partner_class_parses_case_insensitively() {
        assert_eq!("mart".parse::<PartnerClass>(), Ok(PartnerClass::Mart));
        assert_eq!(" Online ".parse::<PartnerClass>(), Ok(PartnerClass::Online));
        assert!("grocery".parse::<PartnerClass>().is_err());
    }

    #[test]
    fn failed_record_keeps_zero_retry_baseline() {
        let record = failed_record();

        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.points, 0);
        assert!(record.is_retryable(3));
    }

    #[test]
    fn retry_failures_flip_to_exhausted_at_maximum() {
        let mut record = failed_record();
        let now = OffsetDateTime::now_utc();

        assert_eq!(
            record.record_retry_failure("503", now, 2, false),
            Ok(RecordStatus::Failed)
        );
        assert_eq!(
            record.record_retry_failure("503", now, 2, false),
            Ok(RecordStatus::MaxRetryExceeded)
        );
        assert_eq!(record.retry_count, 2);
        assert!(!record.is_retryable(2));
    }

    #[test]
    fn terminal_records_refuse_transitions_and_keep_retry_count() {
        let mut record = failed_record();
        let now = OffsetDateTime::now_utc();
        record.complete(120, now).expect("failed record can complete");

        let error = record
            .record_retry_failure("late failure", now, 3, false)
            .expect_err("completed record is terminal");

        assert_eq!(error.status, RecordStatus::Completed);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.last_retry_time, Some(now));
        assert!(record.fail("again").is_err());
    }

    #[test]
    fn give_up_exhausts_immediately() {
        let mut record = failed_record();

        let status = record
            .record_retry_failure("400 bad request", OffsetDateTime::now_utc(), 5, true)
            .expect("open record");

        assert_eq!(status, RecordStatus::MaxRetryExceeded);
        assert_eq!(record.retry_count, 1);
    }
}
