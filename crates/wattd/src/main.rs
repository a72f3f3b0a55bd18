//! wattd — the wattgrid daemon.
//!
//! # Usage
//!
//! ```text
//! wattd simulate --scenario demos/small.toml --config wattgrid.toml
//! wattd check-config wattgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use wattd::Simulation;
use wattgrid_core::{LogHooks, WattgridConfig};
use wattgrid_sim::Scenario;

#[derive(Parser)]
#[command(name = "wattd", about = "Wattgrid power-management daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop against a simulated data center.
    Simulate {
        /// Scenario file (TOML).
        #[arg(long)]
        scenario: PathBuf,

        /// Daemon configuration file (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop after this many simulated seconds.
        #[arg(long, default_value = "86400")]
        until: u64,

        /// Pace the simulation at one simulated second per wall-clock second.
        #[arg(long)]
        realtime: bool,

        /// Keep the loop running this many seconds after the work drains.
        #[arg(long, default_value = "0")]
        linger: u64,

        /// Also print the final cluster status.
        #[arg(long)]
        status: bool,
    },
    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        /// Configuration file (TOML).
        path: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WattgridConfig> {
    match path {
        Some(path) => {
            WattgridConfig::from_file(path).with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(WattgridConfig::default()),
    }
}

fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,wattd=debug,wattgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            scenario,
            config,
            until,
            realtime,
            linger,
            status,
        } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.general.log_format);
            run_simulation(&scenario, config, until, realtime, linger, status).await
        }
        Command::CheckConfig { path } => {
            let config = load_config(Some(&path))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_simulation(
    scenario_path: &Path,
    config: WattgridConfig,
    until: u64,
    realtime: bool,
    linger: u64,
    status: bool,
) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(scenario_path)?;
    let mut simulation = Simulation::new(&scenario, config, Arc::new(LogHooks))?;
    info!(scenario = %scenario_path.display(), until, realtime, "simulation starting");

    let mut report = if realtime {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
        simulation.run_paced(until, Duration::from_secs(1), shutdown_rx).await
    } else {
        simulation.run(until)
    };
    if linger > 0 {
        report = simulation.linger(linger);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    if status {
        println!("{}", serde_json::to_string_pretty(&simulation.daemon().status())?);
    }
    info!(ended_at = report.ended_at, finished = report.jobs_finished, "simulation finished");
    Ok(())
}
