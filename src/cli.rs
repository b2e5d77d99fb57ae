//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the node executor.

use clap::{Parser, Subcommand};

use crate::config::RunnerKind;
use crate::driver::DispatchPolicy;

/// Node Executor - runs cluster tasks on behalf of a node agent
///
/// Registers with the node agent on this machine, runs the tasks it is
/// handed and reports their lifecycle status back.
#[derive(Parser, Debug)]
#[command(name = "node-executor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the executor
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the executor (connects to the node agent and runs tasks)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "NODE_EXECUTOR_CONFIG")]
        config: Option<String>,

        /// Node agent WebSocket URL
        #[arg(long)]
        agent_url: Option<String>,

        /// Executor ID to register with
        #[arg(long)]
        executor_id: Option<String>,

        /// Launch dispatch policy
        #[arg(long, value_enum)]
        dispatch: Option<DispatchPolicy>,

        /// Task runner
        #[arg(long, value_enum)]
        runner: Option<RunnerKind>,
    },

    /// Display version information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
