use pointgate_core::config::PartnerOverrides;
use pointgate_core::GatewayConfig;
use serde_json::{json, Value};

use crate::error::CliError;

pub fn run(config: &GatewayConfig) -> Result<Value, CliError> {
    let mut partners = serde_json::Map::new();
    for policy in config.policy_set().iter() {
        partners.insert(
            policy.partner_class.key().to_owned(),
            serde_json::to_value(PartnerOverrides::from(policy.as_ref()))?,
        );
    }

    Ok(json!({
        "downstream": config.downstream,
        "scheduler": config.scheduler,
        "events": config.events,
        "partners": partners,
    }))
}
