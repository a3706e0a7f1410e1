use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

use virby::activation::{self, LaunchdSource};
use virby::config::VmConfig;
use virby::error::VirbyError;
use virby::runner::Runner;
use virby::signals::ShutdownCoordinator;
use virby::vm::VmSupervisor;
use virby::{logging, vm};

#[derive(Parser)]
#[command(
    name = "virby-vm-runner",
    version,
    about = "Supervise the on-demand Linux builder VM behind a launchd socket"
)]
struct Cli {
    /// Path to the JSON configuration file (defaults to $VIRBY_VM_CONFIG_FILE)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<VmConfig, VirbyError> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("VIRBY_VM_CONFIG_FILE").map(PathBuf::from))
        .ok_or_else(|| {
            VirbyError::Configuration(
                "no configuration file: pass --config or set VIRBY_VM_CONFIG_FILE".into(),
            )
        })?;
    VmConfig::from_file(&config_path)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            logging::init(false);
            error!(error = %e, "fatal error");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.debug);

    let signals = Arc::new(ShutdownCoordinator::new());
    match run(config, Arc::clone(&signals)).await {
        Ok(()) => {
            info!("virby VM runner exiting");
            if signals.was_interrupted() {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: VmConfig, signals: Arc<ShutdownCoordinator>) -> Result<()> {
    info!(port = config.port, on_demand = config.on_demand, "virby VM runner starting");
    debug_startup_environment();

    signals.install()?;

    let working_dir = config.working_directory();
    if let Err(e) = vm::pidfile::cleanup_orphans(&working_dir).await {
        warn!(error = %e, "orphan cleanup failed");
    }

    let supervisor =
        Arc::new(VmSupervisor::new(config.clone()).context("failed to initialize VM supervisor")?);

    // A signal must also latch the supervisor itself, so a start or resume
    // already in flight aborts at its next shutdown check.
    let hook_supervisor = Arc::clone(&supervisor);
    signals.add_shutdown_hook(move || hook_supervisor.request_shutdown());

    let listener = activation::acquire_activation_socket(&LaunchdSource, config.port)?;

    let runner = Runner::new(config, supervisor, Arc::clone(&signals));
    runner.run(listener).await
}

/// At debug level, record the launcher environment, useful when launchd
/// hands us something unexpected.
fn debug_startup_environment() {
    for var in [
        "VIRBY_VM_CONFIG_FILE",
        "VIRBY_WORKING_DIRECTORY",
        "LISTEN_FDS",
        "LISTEN_PID",
        "LAUNCH_DAEMON_SOCKET_NAME",
    ] {
        debug!(%var, value = %std::env::var(var).unwrap_or_else(|_| "null".into()), "startup env");
    }
}
