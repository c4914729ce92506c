mod accumulate;
mod ledger;
mod policies;
mod reconcile;
mod run;

use pointgate_core::{ControlPlane, GatewayConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub async fn run(cli: &Cli) -> Result<Value, CliError> {
    let config = GatewayConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Accumulate(args) => {
            let plane = control_plane(config, cli.mock).await?;
            accumulate::run(args, &plane).await
        }
        Command::Reconcile => {
            let plane = control_plane(config, cli.mock).await?;
            reconcile::run(&plane).await
        }
        Command::Run => {
            let plane = control_plane(config, cli.mock).await?;
            run::run(&plane).await
        }
        Command::Ledger(args) => ledger::run(args, &config),
        Command::Policies => policies::run(&config),
    }
}

async fn control_plane(config: GatewayConfig, use_mock: bool) -> Result<ControlPlane, CliError> {
    Ok(ControlPlane::from_config(config, use_mock).await?)
}
