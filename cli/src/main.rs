//! Single entry point for both coordinator tiers: `swarmctl overmind`
//! starts (or joins, as a satellite) a coordinator; `swarmctl colony` is
//! the subcommand the Overmind's subprocess manager re-execs into.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use swarm_core::bus::BusClient;
use swarm_core::colony::Colony;
use swarm_core::hatchling::HatcheryRegistry;
use swarm_core::overmind::Overmind;
use swarm_core::partition::PartitionLimits;
use swarm_core::settings::{load_hatchling_configs, load_settings};
use swarm_core::subprocess::SubprocessManager;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Root or satellite coordinator: partitions work and spawns colonies.
    Overmind(OvermindArgs),
    /// Worker process: fetches its assignment and runs its hatchlings.
    Colony(ColonyArgs),
}

#[derive(Parser, Debug)]
struct OvermindArgs {
    #[clap(long, default_value = "0.0.0.0:0", env = "SWARM_BIND_ADDRESS")]
    bind_address: String,

    /// Address of a central Overmind; presence of this flag puts this
    /// process into satellite mode.
    #[clap(long, env = "SWARM_CENTRAL_SERVER")]
    central_server: Option<String>,

    #[clap(long, env = "SWARM_SETTINGS_FILE")]
    settings_file: String,

    #[clap(long, env = "SWARM_HATCHERY_FILE")]
    hatchery_file: String,

    #[clap(long, value_enum, default_value = "info", env = "SWARM_LOG_LEVEL")]
    log_level: LogLevel,

    /// Seconds to sleep before doing anything — lets a fleet of satellites
    /// launched together stagger their startup.
    #[clap(long, default_value_t = 0)]
    launch_delay: u64,

    /// Minutes between intermediate (non-resetting) stats reports; ignored
    /// unless greater than 1.
    #[clap(long, default_value_t = 0)]
    reporting_interval: u64,
}

#[derive(Parser, Debug)]
struct ColonyArgs {
    #[clap(long, env = "SWARM_BIND_ADDRESS")]
    bind_address: String,

    #[clap(long, env = "SWARM_HATCHERY_FILE")]
    hatchery_file: String,

    #[clap(long, value_enum, default_value = "info", env = "SWARM_LOG_LEVEL")]
    log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

fn init_logging(level: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::from(level).to_string()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_registry() -> HatcheryRegistry {
    let mut registry = HatcheryRegistry::new();
    sample_hatchery::register(&mut registry);
    registry
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Overmind(args) => run_overmind(args),
        Command::Colony(args) => run_colony(args),
    }
}

fn run_colony(args: ColonyArgs) -> anyhow::Result<()> {
    init_logging(args.log_level);
    let registry = build_registry();
    let colony = Colony::new(args.bind_address, args.hatchery_file, registry);
    colony.run()?;
    Ok(())
}

fn run_overmind(args: OvermindArgs) -> anyhow::Result<()> {
    init_logging(args.log_level);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_overmind_async(args))
}

async fn run_overmind_async(args: OvermindArgs) -> anyhow::Result<()> {
    let settings = load_settings(&args.settings_file)?;
    let configs = load_hatchling_configs(
        &settings.hatchling_config_file,
        settings.hatchling_offset,
        settings.hatchling_count,
        &settings.hatchling_overrides,
    )?;

    let slots = swarm_core::subprocess::available_colony_slots();
    let limits = PartitionLimits {
        min_per_colony: settings.min_hatchlings_per_colony,
        max_per_colony: settings.max_hatchlings_per_colony,
    };

    let central = match &args.central_server {
        Some(address) => Some(Arc::new(BusClient::connect(address).await?)),
        None => None,
    };

    let handle = Overmind::bind(&args.bind_address, configs, slots, limits, central.clone()).await?;
    info!(address = %handle.address, colonies = handle.colony_count, "overmind bus listening");

    // Grab a handle onto the shared state before spawning `handle.serve`,
    // which partially moves `handle` — everything after this point that
    // needs the accumulator or start time goes through `control` instead.
    let control = handle.accumulator_view();
    let address = handle.address.clone();
    let colony_count = handle.colony_count;

    // Serve bus connections immediately, so satellites can reach us for the
    // whole launch-delay window rather than only once it elapses.
    tokio::spawn(handle.serve);

    if args.launch_delay > 0 {
        control.set_start_time(swarm_core::overmind::unix_seconds_from_now(args.launch_delay)).await;
    }

    if args.reporting_interval > 1 {
        let view = control.clone();
        let interval = Duration::from_secs(args.reporting_interval * 60);
        tokio::spawn(swarm_core::overmind::run_intermediate_reporting(view, interval));
    }

    let mut start_time = control.peek_start_time().await;

    if let Some(central) = &central {
        let reply = central.call("satellite_action", serde_json::json!({ "action": "register" })).await;
        if let Some(start) = reply.and_then(|r| r.get("start").and_then(|s| s.as_i64())) {
            control.set_start_time(start).await;
            start_time = Some(start);
        }
    }

    if let Some(start) = start_time {
        info!(start, "waiting for planned start time before spawning colonies");
        swarm_core::overmind::sleep_until_unix(start).await;
    }

    let manager = SubprocessManager::new();
    manager.run_colonies(&address, &args.hatchery_file, colony_count)?;

    manager.wait_all(Duration::from_millis(500)).await;

    if let Some(central) = &central {
        central.call("satellite_action", serde_json::json!({ "action": "unregister" })).await;
    } else {
        control.wait_for_satellite_drain().await;
    }

    Ok(())
}
