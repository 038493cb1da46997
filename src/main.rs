use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flasher::adapters;
use flasher::config::StationConfig;
use flasher::context::AppContext;
use flasher::core::{Orchestrator, SystemRunner, UsbEnumerator, notifications};
use flasher::logging::{self, LogConfig};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "flasher")]
#[command(about = "USB flashing station: wipe, format, clone and verify every stick plugged in", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for new USB storage devices and flash each one.
    Run(RunArgs),
    /// List the USB mass-storage devices currently attached.
    Devices {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Serialize)]
struct RunArgs {
    /// Configuration file (defaults to /etc/flasher/config.toml).
    #[serde(skip)]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to clone onto each formatted device; repeat for several.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[arg(short = 'c', long = "clone")]
    clone: Vec<PathBuf>,

    /// File extension to skip while cloning; repeat for several.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[arg(short = 'x', long = "exclude")]
    exclude: Vec<String>,

    /// Volume label for the formatted devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    label: Option<String>,

    /// Directory for temporary mount points.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    tmp_mount: Option<PathBuf>,

    /// Number of devices to work on at once.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
    concurrent: Option<u64>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(short, long)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => run_station(args).await,
            Commands::Devices { json } => list_devices(json),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_station(args: RunArgs) -> Result<()> {
    let config = StationConfig::new(args.config.as_deref(), Some(&args))
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    info!(
        sources = config.clone.len(),
        label = %config.label,
        concurrent = config.concurrent,
        "Starting flashing station; every new USB storage device will be erased"
    );

    let runner = SystemRunner::detect();
    runner
        .ensure_privileges()
        .await
        .context("Cannot run commands as root (run as root or allow passwordless sudo)")?;

    let monitor = adapters::device_monitor(&config.timing).context("Failed to start device monitor")?;
    let ctx = AppContext::new(
        config,
        std::sync::Arc::new(runner),
        notifications::default_notifier(),
    );

    Orchestrator::new(ctx)
        .start(monitor, shutdown_signal())
        .await
        .context("Station stopped")
}

fn list_devices(json: bool) -> Result<()> {
    let mut devices: Vec<_> = adapters::UdevEnumerator
        .list_storage_devices()
        .context("Failed to enumerate USB devices")?
        .into_iter()
        .collect();
    devices.sort();

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No USB mass-storage devices attached");
    } else {
        for device in devices {
            println!("{device}");
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
