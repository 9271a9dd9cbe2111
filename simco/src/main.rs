//! # Simco Coordinator Service
//!
//! Loads the coordinator configuration, brings up the registry and the
//! module manager, sets the scenario up and plays it until it stops,
//! fails or a shutdown signal arrives.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use simco::connection::TcpConnectionFactory;
use simco::coordinator::{CommandInfo, Coordinator};
use simco::module_mgr::ModuleManagerImpl;
use simco::process::OsModuleProcessService;
use simco::registry::ModuleRegistry;
use simco_common::config::{ConfigLoader, JsonConfigLoader};
use simco_common::status::{CmdErrorCode, Command};

/// Simco — deterministic simulation coordinator
#[derive(Parser, Debug)]
#[command(name = "simco")]
#[command(version)]
#[command(about = "Drives external module processes through a deterministic simulation timeline")]
struct Args {
    /// Path to the coordinator configuration JSON.
    #[arg(long, default_value = "config/simco.json")]
    config: PathBuf,

    /// Scenario file handed to the modules at reset.
    #[arg(long)]
    scenario: Option<String>,

    /// Directory for per-module log files (overrides the config).
    #[arg(long, value_name = "DIR")]
    module_log_dir: Option<PathBuf>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("simco coordinator v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("simco coordinator shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let loader = JsonConfigLoader::new(&args.config);
    let config = loader.load()?;
    info!(
        mode = ?config.coord_mode,
        modules = config.module_configs.len(),
        "config OK: {}",
        args.config.display()
    );

    let registry = Arc::new(ModuleRegistry::new()?);
    info!(addr = %registry.local_registry_addr(), "module registry serving");

    let log_dir = args.module_log_dir.clone().or_else(|| config.module_log_directory.clone());
    let manager = ModuleManagerImpl::new(
        registry,
        Box::new(TcpConnectionFactory),
        Box::new(OsModuleProcessService),
        log_dir,
        config.override_module_log,
    )?;

    let coordinator = Arc::new(Coordinator::new(Box::new(loader), Box::new(manager)));

    // Graceful shutdown: the flag is observed within one step tick.
    let canceller = Arc::clone(&coordinator);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        canceller.execute(CommandInfo::new(Command::UnSetup), false);
    })?;

    let mut setup = CommandInfo::new(Command::Setup);
    if let Some(scenario) = &args.scenario {
        setup.reset_params.scenario_path = scenario.clone();
    }
    let ec = coordinator.execute(setup, false);
    if ec > CmdErrorCode::Succeed {
        return Err(format!("scenario setup failed: {ec:?}").into());
    }
    info!("scenario set up, entering run loop");

    let ec = coordinator.execute(CommandInfo::new(Command::Run), false);
    match ec {
        CmdErrorCode::Succeed | CmdErrorCode::Accepted | CmdErrorCode::ScenarioStopped => {
            info!(sim_time = coordinator.current_simulation_time(), "run ended: {ec:?}");
        }
        other => warn!("run ended with {other:?}"),
    }

    coordinator.execute(CommandInfo::new(Command::UnSetup), false);
    if ec >= CmdErrorCode::Failed {
        return Err(format!("run failed: {ec:?}").into());
    }
    Ok(())
}

fn setup_tracing(args: &Args) {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
