//! Offload Listener
//!
//! Daemon that watches a shared inbox directory for job scripts queued by
//! hosts without direct scheduler access, submits each to the scheduler, and
//! writes back the correlation id-file. Runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use offload_core::{Listener, SchedulerCommand};

#[derive(Parser)]
#[command(name = "offload-listener")]
#[command(about = "Watch an inbox directory for job scripts and submit them", long_about = None)]
struct Cli {
    /// Inbox directory to watch for job scripts
    inbox: PathBuf,

    /// Seconds between inbox scans
    #[arg(long, env = "OFFLOAD_SCAN_INTERVAL", default_value_t = 1)]
    scan_interval: u64,

    /// Scheduler submit command
    #[arg(long, env = "OFFLOAD_SUBMIT_CMD", default_value = "sbatch")]
    submit_cmd: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offload_listener=info,offload_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let scheduler = SchedulerCommand {
        submit_cmd: cli.submit_cmd,
        ..SchedulerCommand::slurm()
    };
    if !scheduler.is_available() {
        warn!(
            "submit command '{}' does not run on this host; queued scripts will be answered with failures",
            scheduler.submit_cmd
        );
    }

    let listener = Listener::new(&cli.inbox, Arc::new(scheduler))
        .with_scan_interval(Duration::from_secs(cli.scan_interval.max(1)));

    let cancel = install_shutdown_handler();

    info!("watching inbox {}", cli.inbox.display());
    listener
        .run(cancel)
        .await
        .context("listener loop failed")?;

    Ok(())
}

/// Returns a token cancelled on ctrl-c
fn install_shutdown_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            trigger.cancel();
        }
    });

    cancel
}
