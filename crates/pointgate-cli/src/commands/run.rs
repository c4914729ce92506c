use std::sync::Arc;

use pointgate_core::ControlPlane;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::CliError;

pub async fn run(plane: &ControlPlane) -> Result<Value, CliError> {
    let cancel = CancellationToken::new();
    let handle = Arc::clone(plane.scheduler()).spawn(cancel.clone());

    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        error!(error = %signal_error, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, stopping scheduler");
    cancel.cancel();

    if let Err(join_error) = handle.await {
        error!(error = %join_error, "scheduler task ended abnormally");
    }

    let counts = plane.ledger().status_counts()?;
    Ok(json!({
        "stopped": true,
        "statusCounts": counts
            .into_iter()
            .map(|(status, count)| (status.to_string(), json!(count)))
            .collect::<serde_json::Map<_, _>>(),
    }))
}
