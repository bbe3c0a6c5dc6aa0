use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "emreg")]
#[command(about = "Keeps the local designated materials registry in sync with the published list")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile now, then every interval until interrupted.
    Run {
        /// Overrides EMREG_SYNC_INTERVAL_SECS.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Reconcile once, wait for the writes and exit.
    Once {
        /// Compute the plan without writing to the store.
        #[arg(long)]
        dry_run: bool,
        /// Print the cycle summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { interval_secs: None }) {
        Commands::Run { interval_secs } => {
            emreg_sync::run_scheduler_from_env(interval_secs.map(Duration::from_secs)).await?;
        }
        Commands::Once { dry_run, json } => {
            let report = emreg_sync::run_once_from_env(dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let summary = &report.summary;
                println!(
                    "cycle complete: run_id={} remote={} local={} create={} delete={} inserted={} deleted={}{}",
                    summary.run_id,
                    summary.remote_entries,
                    summary.local_records,
                    summary.to_create,
                    summary.to_delete,
                    report.writes.inserted.unwrap_or(0),
                    report.writes.deleted.unwrap_or(0),
                    if summary.dry_run { " (dry run)" } else { "" }
                );
            }
        }
    }

    Ok(())
}
