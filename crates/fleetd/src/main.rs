//! fleetd: the FleetGrid scheduler.
//!
//! Loads a scheduler configuration (TOML) and a fleet inventory (JSON),
//! places the inventory's pending workloads and reports the decisions.
//!
//! # Usage
//!
//! ```text
//! fleetd schedule --inventory fleet.json --config scheduler.toml --dry-run
//! fleetd serve --inventory fleet.json
//! fleetd stats --inventory fleet.json --probe probe.json
//! fleetd default-config > scheduler.toml
//! ```

mod inventory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetgrid_framework::SchedulerConfig;
use fleetgrid_placement::{default_config, default_profile, in_tree_registry};
use fleetgrid_scheduler::{ScheduleResult, Scheduler};
use fleetgrid_state::Workload;

use crate::inventory::Inventory;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid workload scheduler")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place the inventory's pending workloads and print the decisions.
    Schedule {
        #[arg(long)]
        inventory: PathBuf,

        /// Scheduler configuration; the default profile when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Leave the cache as it was after scheduling.
        #[arg(long)]
        dry_run: bool,

        /// Print decisions as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Schedule, then keep expiring unconfirmed placements until Ctrl-C.
    Serve {
        #[arg(long)]
        inventory: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print per-host usage.
    Stats {
        #[arg(long)]
        inventory: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Workload (JSON) to count how many more copies fit per host.
        #[arg(long)]
        probe: Option<PathBuf>,
    },

    /// Print the default scheduler configuration.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Schedule {
            inventory,
            config,
            dry_run,
            json,
        } => run_schedule(&inventory, config.as_deref(), dry_run, json),
        Command::Serve { inventory, config } => run_serve(&inventory, config.as_deref()).await,
        Command::Stats {
            inventory,
            config,
            probe,
        } => run_stats(&inventory, config.as_deref(), probe.as_deref()),
        Command::DefaultConfig => {
            print!("{}", default_config().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    let Some(path) = path else {
        return Ok(default_config());
    };
    let mut config = SchedulerConfig::from_file(path)
        .with_context(|| format!("loading scheduler config {}", path.display()))?;
    if config.profiles.is_empty() {
        warn!(path = %path.display(), "config has no profiles, using the default profile");
        config.profiles.push(default_profile());
    }
    Ok(config)
}

fn build_scheduler(inventory: &Path, config: Option<&Path>) -> anyhow::Result<(Scheduler, Inventory)> {
    let config = load_config(config)?;
    let registry = in_tree_registry()?;
    let scheduler = Scheduler::new(&config, &registry)?;
    let inventory = Inventory::from_file(inventory)?;
    inventory.load_into(&scheduler)?;
    info!(
        hosts = inventory.hosts.len(),
        running = inventory.running.len(),
        pending = inventory.pending.len(),
        profiles = ?scheduler.profile_names(),
        "inventory loaded"
    );
    Ok((scheduler, inventory))
}

fn print_results(results: &[ScheduleResult], json: bool) -> anyhow::Result<()> {
    for r in results {
        if json {
            println!("{}", serde_json::to_string(r)?);
        } else {
            println!(
                "{:<40} -> {:<24} ({} feasible of {} evaluated)",
                r.workload, r.suggested_host, r.feasible_nodes, r.evaluated_nodes
            );
        }
    }
    Ok(())
}

fn run_schedule(
    inventory: &Path,
    config: Option<&Path>,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let (scheduler, inventory) = build_scheduler(inventory, config)?;
    let results = scheduler.schedule(&inventory.pending, dry_run)?;
    print_results(&results, json)
}

async fn run_serve(inventory: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let (scheduler, inventory) = build_scheduler(inventory, config)?;

    // Place what fits; unschedulable workloads are only reported.
    let mut placed = Vec::new();
    for workload in &inventory.pending {
        match scheduler.schedule_one(workload) {
            Ok(r) => placed.push(r),
            Err(e) if e.is_unschedulable() => {
                warn!(workload = %workload.full_name(), reason = %e, "workload left pending");
            }
            Err(e) => return Err(e.into()),
        }
    }
    print_results(&placed, false)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cache = Arc::clone(scheduler.cache());
    let expiry = tokio::spawn(cache.run(shutdown_rx));
    info!("fleetd serving, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    expiry.await?;

    info!("fleetd stopped");
    Ok(())
}

fn run_stats(inventory: &Path, config: Option<&Path>, probe: Option<&Path>) -> anyhow::Result<()> {
    let (scheduler, _) = build_scheduler(inventory, config)?;
    let probe: Option<Workload> = match probe {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading probe {}", path.display()))?;
            Some(serde_json::from_str(&content)?)
        }
        None => None,
    };
    for s in scheduler.statistics(probe.as_ref()) {
        println!("{}", serde_json::to_string(&s)?);
    }
    Ok(())
}
