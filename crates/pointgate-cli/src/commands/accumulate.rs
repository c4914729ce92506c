use pointgate_core::{AccumulationCommand, ControlPlane};
use serde_json::Value;

use crate::cli::AccumulateArgs;
use crate::error::CliError;

pub async fn run(args: &AccumulateArgs, plane: &ControlPlane) -> Result<Value, CliError> {
    let command = AccumulationCommand::new(
        args.member.as_str(),
        args.partner.as_str(),
        args.class.as_str(),
        args.amount,
    );

    let accumulated = plane.pipeline().accumulate(&command).await?;
    Ok(serde_json::to_value(accumulated)?)
}
