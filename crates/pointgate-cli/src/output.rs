use serde::Serialize;
use serde_json::{json, Value};

use crate::error::CliError;

pub fn render(value: &Value, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{payload}");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: String,
    exit_code: u8,
}

/// Machine-readable form of a failed command, written to stdout.
pub fn error_payload(error: &CliError) -> Value {
    let kind = match error {
        CliError::Accumulation(inner) => inner.kind().as_str(),
        CliError::Config(_) => "config",
        CliError::Startup(_) => "startup",
        CliError::Ledger(_) => "ledger",
        CliError::NotFound { .. } => "not_found",
        CliError::Serialization(_) => "serialization",
        CliError::Io(_) => "io",
    };
    json!({
        "error": ErrorBody {
            kind,
            message: error.to_string(),
            exit_code: error.exit_code(),
        }
    })
}
