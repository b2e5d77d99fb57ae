//! Node Executor - cluster task executor
//!
//! This is the main entry point for the node-executor binary.
//! The executor registers with the node agent, runs the tasks it is
//! handed and reports their status back until the agent shuts it down.

mod cli;
mod config;
mod driver;
mod error;
mod executor;
mod logging;
mod protocol;
mod types;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::ExecutorConfig;
use crate::driver::{DriverConfig, DriverStatus, NodeAgentDriver};
use crate::error::{Error, Result};
use crate::executor::{runner_from_settings, TaskExecutor};
use crate::protocol::PROTOCOL_VERSION;

fn main() {
    if let Err(e) = run() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    let (config_path, overrides) = match cli.command {
        Commands::Version => {
            print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => return handle_config_command(subcommand),
        Commands::Run {
            config,
            agent_url,
            executor_id,
            dispatch,
            runner,
        } => (
            config,
            RunOverrides {
                agent_url,
                executor_id,
                dispatch,
                runner,
            },
        ),
    };

    let mut config = ExecutorConfig::load(config_path.as_deref())?;
    overrides.apply(&mut config)?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = %PROTOCOL_VERSION,
        "Starting node executor"
    );

    run_executor(config)
}

/// Command-line settings that win over file and environment
struct RunOverrides {
    agent_url: Option<String>,
    executor_id: Option<String>,
    dispatch: Option<driver::DispatchPolicy>,
    runner: Option<config::RunnerKind>,
}

impl RunOverrides {
    fn apply(self, config: &mut ExecutorConfig) -> Result<()> {
        if let Some(url) = self.agent_url {
            config.agent.url = url;
        }
        if let Some(id) = self.executor_id {
            config.executor.id = Some(id);
        }
        if let Some(dispatch) = self.dispatch {
            config.executor.dispatch = dispatch;
        }
        if let Some(runner) = self.runner {
            config.runner.kind = runner;
        }
        config.validate()
    }
}

fn print_version() {
    println!("node-executor {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Build Information:");
    println!("  Git Hash:   {}", env!("NODE_EXECUTOR_GIT_HASH"));
    println!("  Profile:    {}", env!("NODE_EXECUTOR_PROFILE"));
    println!("  Target:     {}", env!("NODE_EXECUTOR_TARGET"));
    println!("  Compiler:   {}", env!("NODE_EXECUTOR_RUSTC_VERSION"));
    println!();
    println!("Protocol:     {}", PROTOCOL_VERSION);
}

/// Run the executor until the driver stops
fn run_executor(config: ExecutorConfig) -> Result<()> {
    info!(
        executor_id = %config.executor.executor_id(),
        agent_url = %config.agent.url,
        dispatch = ?config.executor.dispatch,
        runner = %config.runner.kind,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("node-executor")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_executor_main(config))
}

async fn async_executor_main(config: ExecutorConfig) -> Result<()> {
    let runner = runner_from_settings(&config.runner);
    let executor = Arc::new(
        TaskExecutor::new(runner)
            .with_task_timeout(config.executor.task_timeout())
            .with_shutdown_grace(config.executor.shutdown_grace()),
    );

    let driver = NodeAgentDriver::new(DriverConfig::from_config(&config), executor.clone())?;
    driver.start()?;

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let status = tokio::select! {
        status = driver.join() => status,
        _ = &mut shutdown_signal => {
            info!("Shutdown signal received");
            driver.stop().await
        }
    };

    let snapshot = executor.tracker().snapshot();
    info!(
        status = %status,
        launched = snapshot.launched,
        finished = snapshot.finished,
        failed = snapshot.failed,
        killed = snapshot.killed,
        "Executor exiting"
    );

    if snapshot.active > 0 {
        warn!(tasks = ?executor.tracker().active_task_ids(), "Exiting with tasks still running");
    }

    match status {
        DriverStatus::Aborted => {
            error!("Driver aborted");
            Err(Error::connection_lost("driver aborted"))
        }
        _ => Ok(()),
    }
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = ExecutorConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let created = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", created.display());
        }
        ConfigSubcommand::Validate { config } => {
            ExecutorConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
