use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use access_reconciler::config::ReconcilerConfig;
use access_reconciler::telemetry::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "access-reconciler",
    version,
    about = "Reconcile account access assignments from declarative links"
)]
struct Cli {
    /// Configuration file (YAML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "access-reconciler.yml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check link descriptors against the grammar
    ValidateLink {
        /// Descriptors such as `ou_id.ou-ab12-cdefgh34.ReadOnly.Engineers.ssofile`
        #[arg(required = true)]
        descriptors: Vec<String>,
    },
    /// Inspect a provisioned-assignment ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Replay lifecycle events against a simulated organization
    Simulate {
        /// World description (YAML)
        #[arg(long)]
        world: PathBuf,
        /// Events, one JSON object per line
        #[arg(long)]
        events: PathBuf,
        /// Persist the ledger to this JSONL file instead of memory
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// List confirmed assignments
    List {
        /// Ledger file (JSONL)
        path: PathBuf,
        /// Only this target account
        #[arg(long)]
        account: Option<String>,
        /// Only this principal id
        #[arg(long)]
        principal: Option<String>,
    },
    /// Summary counts
    Stats {
        /// Ledger file (JSONL)
        path: PathBuf,
    },
}

fn load_config(path: &Path) -> anyhow::Result<ReconcilerConfig> {
    ReconcilerConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format, &cli.log_level);

    match cli.command {
        Commands::ValidateLink { descriptors } => {
            let all_valid = access_reconciler::cli::validate_link::run(&descriptors).await?;
            if !all_valid {
                std::process::exit(1);
            }
        }
        Commands::Ledger { command } => match command {
            LedgerCommands::List {
                path,
                account,
                principal,
            } => {
                access_reconciler::cli::ledger::run_list(
                    &path,
                    account.as_deref(),
                    principal.as_deref(),
                )
                .await?;
            }
            LedgerCommands::Stats { path } => {
                access_reconciler::cli::ledger::run_stats(&path).await?;
            }
        },
        Commands::Simulate {
            world,
            events,
            ledger,
        } => {
            let config = load_config(&cli.config)?;
            let summary = access_reconciler::cli::simulate::run(
                config,
                &world,
                &events,
                ledger.as_deref(),
            )
            .await?;
            if summary.run.failed_events > 0 {
                eprintln!(
                    "access-reconciler: {} event(s) failed, see notifications",
                    summary.run.failed_events
                );
            }
        }
    }

    Ok(())
}
