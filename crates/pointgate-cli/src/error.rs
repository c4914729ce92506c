use pointgate_core::{AccumulationError, ConfigError, ControlPlaneError, ErrorKind};
use pointgate_ledger::LedgerError;
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] ControlPlaneError),

    #[error(transparent)]
    Accumulation(#[from] AccumulationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("record '{id}' not found")]
    NotFound { id: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::NotFound { .. } => 3,
            Self::Serialization(_) => 4,
            Self::Startup(_) | Self::Ledger(_) | Self::Io(_) => 10,
            Self::Accumulation(error) => match error.kind() {
                ErrorKind::Validation => 2,
                ErrorKind::Throttled => 20,
                ErrorKind::CircuitOpen => 21,
                ErrorKind::RetriesExhausted => 22,
                ErrorKind::Rejected => 23,
                ErrorKind::Ledger => 10,
            },
        }
    }
}
