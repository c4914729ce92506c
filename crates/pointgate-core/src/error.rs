use pointgate_ledger::{LedgerError, PartnerClass, UnknownPartnerClass};
use thiserror::Error;

use crate::circuit_breaker::CircuitState;
use crate::downstream::DownstreamError;

/// Request validation errors. These are never retried and never persisted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("member id cannot be empty")]
    EmptyMemberId,
    #[error("partner id cannot be empty")]
    EmptyPartnerId,
    #[error("amount must be greater than zero, got {amount}")]
    NonPositiveAmount { amount: i64 },
    #[error(transparent)]
    InvalidPartnerClass(#[from] UnknownPartnerClass),
}

/// Flat classification of [`AccumulationError`] used for exit codes and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Throttled,
    CircuitOpen,
    RetriesExhausted,
    Rejected,
    Ledger,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Throttled => "throttled",
            Self::CircuitOpen => "circuit_open",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Rejected => "rejected",
            Self::Ledger => "ledger",
        }
    }
}

/// Failure outcome of a synchronous accumulation request.
#[derive(Debug, Error)]
pub enum AccumulationError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("rate limit exhausted for partner class {partner_class}")]
    Throttled { partner_class: PartnerClass },

    #[error("circuit '{target}' is {state}; call not permitted")]
    CircuitOpen { target: String, state: CircuitState },

    #[error("downstream call failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: DownstreamError,
    },

    #[error("downstream rejected the request: {0}")]
    Rejected(#[source] DownstreamError),

    /// The outcome could not be recorded durably.
    #[error("failed to record accumulation outcome: {0}")]
    Ledger(#[from] LedgerError),
}

impl AccumulationError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Ledger(_) => ErrorKind::Ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_class_errors_convert_into_validation() {
        let error: ValidationError = "kiosk"
            .parse::<PartnerClass>()
            .expect_err("unknown class")
            .into();
        let error = AccumulationError::from(error);

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(error.to_string().contains("kiosk"));
    }

    #[test]
    fn exhausted_error_reports_attempts_and_cause() {
        let error = AccumulationError::RetriesExhausted {
            attempts: 3,
            source: DownstreamError::Timeout { timeout_ms: 500 },
        };

        assert_eq!(error.kind().as_str(), "retries_exhausted");
        assert_eq!(
            error.to_string(),
            "downstream call failed after 3 attempt(s): downstream call timed out after 500ms"
        );
    }
}
