//! CLI argument definitions for Pointgate.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `accumulate` | Run one accumulation through the admission pipeline |
//! | `reconcile` | Run a single retry scheduler tick |
//! | `run` | Run the retry scheduler until interrupted |
//! | `ledger` | Inspect the failure ledger |
//! | `policies` | Print effective partner policies |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | YAML configuration file (`POINTGATE_CONFIG`) |
//! | `--mock` | `false` | Use the offline point service |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--log-json` | `false` | Emit logs as JSON on stderr |
//!
//! # Examples
//!
//! ```bash
//! pointgate --mock accumulate --member M-1 --partner P-7 --class mart --amount 12000
//! pointgate reconcile --pretty
//! pointgate ledger list --status failed --limit 20
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pointgate_ledger::RecordStatus;

/// 🎯 Pointgate - resilience control plane for partner point accumulation
#[derive(Debug, Parser)]
#[command(
    name = "pointgate",
    author,
    version,
    about = "Resilience control plane for partner point accumulation",
    long_about = "Pointgate guards calls to the partner point service. Features include:\n\
\n\
  • Per-partner-class rate limiting\n\
  • Circuit breaking per downstream target\n\
  • Bounded retry with exponential backoff\n\
  • DuckDB failure ledger with background reconciliation\n\
  • Lifecycle events over NATS\n\
\n\
Use 'pointgate <command> --help' for command-specific help."
)]
pub struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true, env = "POINTGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use the deterministic offline point service instead of HTTP.
    #[arg(long, global = true, default_value_t = false)]
    pub mock: bool,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// 💳 Accumulate points for one purchase.
    ///
    /// Runs rate limiting, circuit breaking and in-line retry, then records
    /// the outcome in the ledger.
    ///
    /// # Examples
    ///
    ///   pointgate accumulate --member M-1 --partner P-7 --class mart --amount 12000
    Accumulate(AccumulateArgs),

    /// 🔄 Run one reconciliation pass over failed records.
    Reconcile,

    /// ⏱️ Run the retry scheduler until Ctrl-C.
    Run,

    /// 🗄️ Inspect the failure ledger.
    Ledger(LedgerArgs),

    /// 📋 Print effective partner policies.
    Policies,
}

/// Arguments for the `accumulate` command.
#[derive(Debug, Args)]
pub struct AccumulateArgs {
    /// Member identifier.
    #[arg(long)]
    pub member: String,

    /// Partner identifier.
    #[arg(long)]
    pub partner: String,

    /// Partner class (mart, convenience, online).
    #[arg(long)]
    pub class: String,

    /// Purchase amount in minor currency units.
    #[arg(long, allow_negative_numbers = true)]
    pub amount: i64,
}

/// Arguments for the `ledger` command group.
#[derive(Debug, Args)]
pub struct LedgerArgs {
    #[command(subcommand)]
    pub command: LedgerCommand,
}

/// Ledger inspection subcommands.
#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    /// List records, newest first.
    List(ListArgs),

    /// List records the scheduler would pick up next.
    Retryable,

    /// Show a single record by id.
    Show(ShowArgs),

    /// Count records per status.
    Stats,
}

/// Arguments for `ledger list`.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only records with this status.
    #[arg(long, value_enum)]
    pub status: Option<StatusFilter>,

    /// Only records for this member.
    #[arg(long)]
    pub member: Option<String>,

    /// Maximum number of records (0 for no limit).
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

/// Arguments for `ledger show`.
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Record id.
    pub id: String,
}

/// Record status as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Completed,
    Failed,
    MaxRetryExceeded,
}

impl From<StatusFilter> for RecordStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Completed => Self::Completed,
            StatusFilter::Failed => Self::Failed,
            StatusFilter::MaxRetryExceeded => Self::MaxRetryExceeded,
        }
    }
}
