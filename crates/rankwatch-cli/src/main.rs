use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rankwatch_core::Snapshot;
use rankwatch_storage::{SnapshotStore, StoreError};
use rankwatch_sync::{CycleOutcome, SyncConfig, DEFAULT_SNAPSHOT_PATH};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rankwatch")]
#[command(about = "Watches an admissions ranking page and reports position changes")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a cycle now and then on every interval until Ctrl-C.
    Watch,
    /// Run a single cycle.
    Once,
    /// Print the stored snapshot.
    Show {
        #[arg(long, env = "RANKWATCH_SNAPSHOT_PATH", default_value = DEFAULT_SNAPSHOT_PATH)]
        path: PathBuf,
    },
    /// Validate the environment configuration.
    Check,
}

fn setup_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("rankwatch=debug")
        } else {
            EnvFilter::new("rankwatch=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => rankwatch_sync::run_watch_from_env().await?,
        Commands::Once => {
            let outcome = rankwatch_sync::run_cycle_once_from_env().await?;
            println!("{}", describe_outcome(&outcome));
        }
        Commands::Show { path } => {
            let store = SnapshotStore::new(&path);
            match store.load_previous().await {
                Ok(snapshot) => print!("{}", render_table(&snapshot)),
                Err(StoreError::Unavailable { .. }) => {
                    println!("no snapshot stored at {}", path.display());
                }
                Err(err) => return Err(err).context("reading snapshot"),
            }
        }
        Commands::Check => {
            let config = SyncConfig::from_env().context("invalid configuration")?;
            println!(
                "configuration ok: webhook_id={} site_url={} snapshot={} interval={}s",
                config.webhook.id(),
                config.site_url,
                config.snapshot_path.display(),
                config.interval.as_secs()
            );
        }
    }

    Ok(())
}

fn describe_outcome(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Bootstrapped { programs } => {
            format!("baseline stored: programs={programs}")
        }
        CycleOutcome::Unchanged => "no position changes".to_string(),
        CycleOutcome::Notified { changes } => {
            let mut out = format!("notified: changes={}", changes.len());
            for change in changes {
                let previous = change
                    .previous_position
                    .map_or_else(|| "new".to_string(), |p| p.to_string());
                let _ = write!(
                    out,
                    "\n  {} {}: {} -> {}",
                    change.current.code, change.current.name, previous, change.current.position
                );
            }
            out
        }
    }
}

fn render_table(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:>8} {:>12} {:>10} {:>10}  name",
        "code", "position", "applications", "originals", "consents"
    );
    for program in snapshot {
        let _ = writeln!(
            out,
            "{:<10} {:>8} {:>12} {:>10} {:>10}  {}",
            program.code,
            program.position,
            program.total_applications,
            program.total_originals,
            program.total_consents,
            program.name
        );
    }
    out
}
