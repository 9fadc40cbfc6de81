//! `keyfleet` command line: runs an enroll or sign operation against a
//! simulated fleet described by a TOML scenario.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyfleet::sim::Scenario;
use keyfleet::{
    Deadline, DeviceId, EnrollCoordinator, FleetConfig, FleetError, MultiTokenCoordinator,
    OperationContext, ProgressNotifier, StatusCode,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyfleet", version)]
#[command(about = "Enroll or sign with a fleet of security keys", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.keyfleet/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register one device that holds none of the scenario's challenges
    Enroll {
        /// Scenario file
        scenario: PathBuf,
    },

    /// Sign with the first device that recognises a challenge
    Sign {
        /// Scenario file
        scenario: PathBuf,

        /// Report a touch request instead of waiting for the touch
        #[arg(long)]
        no_await_touch: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Serialize)]
struct SignOutput {
    device_id: DeviceId,
    status: StatusCode,
    version: String,
    key_handle: Option<String>,
    signature: Option<String>,
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
    status: StatusCode,
    any_devices_found: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "keyfleet=debug" } else { "keyfleet=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{text}");
    Ok(())
}

fn report_failure(err: FleetError) -> Result<()> {
    print_json(&ErrorOutput {
        error: err.to_string(),
        status: err.status(),
        any_devices_found: err.any_devices_found(),
    })?;
    Err(err.into())
}

/// Progress reporter that logs every coalesced status.
fn progress_logger() -> ProgressNotifier {
    let (tx, mut rx) = mpsc::channel::<keyfleet::Progress>(16);
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            tracing::info!(
                status = %progress.status,
                any_devices_found = progress.any_devices_found,
                "Waiting on device"
            );
        }
    });
    ProgressNotifier::new(tx)
}

fn operation(config: &FleetConfig, scenario: &Scenario) -> Result<OperationContext> {
    let fleet = scenario.build_fleet()?;
    let timing = config.timing();
    Ok(OperationContext::new(
        Arc::new(fleet),
        Arc::new(Deadline::after(timing.timeout)),
        timing,
    ))
}

async fn enroll(config: &FleetConfig, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let ctx = operation(config, &scenario)?;
    let coordinator = EnrollCoordinator::new(
        ctx,
        scenario.enroll_challenges(),
        scenario.sign_challenges()?,
        progress_logger(),
    );
    match coordinator.run().await {
        Ok(enrollment) => print_json(&enrollment),
        Err(err) => report_failure(err),
    }
}

async fn sign(config: &FleetConfig, path: &Path, await_touch: bool) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let ctx = operation(config, &scenario)?;
    let coordinator = MultiTokenCoordinator::sign(ctx, await_touch, progress_logger());
    coordinator.add_challenges(scenario.sign_challenges()?, true);
    match coordinator.run().await {
        Ok(success) => {
            let output = SignOutput {
                device_id: success.device_id.clone(),
                status: success.status,
                version: success.version.clone(),
                key_handle: success
                    .challenge
                    .as_ref()
                    .map(|challenge| challenge.key_handle.to_string()),
                signature: success.signature.as_deref().map(hex::encode),
            };
            success.close();
            print_json(&output)
        }
        Err(err) => report_failure(err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = FleetConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Enroll { scenario } => enroll(&config, &scenario).await,
        Commands::Sign {
            scenario,
            no_await_touch,
        } => sign(&config, &scenario, config.await_touch && !no_await_touch).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
