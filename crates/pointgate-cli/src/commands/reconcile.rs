use pointgate_core::ControlPlane;
use serde_json::{json, Value};

use crate::error::CliError;

pub async fn run(plane: &ControlPlane) -> Result<Value, CliError> {
    let report = plane.scheduler().tick().await;
    let circuits = plane.pipeline().breakers().snapshot();

    Ok(json!({
        "report": report,
        "circuits": circuits
            .into_iter()
            .map(|(target, metrics)| json!({ "target": target, "metrics": metrics }))
            .collect::<Vec<_>>(),
    }))
}
