use pointgate_core::GatewayConfig;
use pointgate_ledger::{Ledger, RecordFilter};
use serde_json::{json, Value};

use crate::cli::{LedgerArgs, LedgerCommand};
use crate::error::CliError;

pub fn run(args: &LedgerArgs, config: &GatewayConfig) -> Result<Value, CliError> {
    let ledger = Ledger::open(config.ledger_config())?;

    match &args.command {
        LedgerCommand::List(list) => {
            let filter = RecordFilter {
                status: list.status.map(Into::into),
                member_id: list.member.clone(),
                limit: list.limit,
            };
            let records = ledger.list(&filter)?;
            Ok(json!({ "count": records.len(), "records": records }))
        }
        LedgerCommand::Retryable => {
            let max_retry_count = config.scheduler.max_retry_count;
            let records = ledger.find_retryable(max_retry_count)?;
            Ok(json!({
                "maxRetryCount": max_retry_count,
                "count": records.len(),
                "records": records,
            }))
        }
        LedgerCommand::Show(show) => match ledger.find(&show.id)? {
            Some(record) => Ok(serde_json::to_value(record)?),
            None => Err(CliError::NotFound {
                id: show.id.clone(),
            }),
        },
        LedgerCommand::Stats => {
            let counts = ledger.status_counts()?;
            let total: u64 = counts.values().sum();
            Ok(json!({
                "dbPath": ledger.db_path().display().to_string(),
                "total": total,
                "byStatus": counts
                    .into_iter()
                    .map(|(status, count)| (status.to_string(), json!(count)))
                    .collect::<serde_json::Map<_, _>>(),
            }))
        }
    }
}
