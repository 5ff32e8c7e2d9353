//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Programmator - ticket-driven coding-agent orchestrator
#[derive(Parser)]
#[command(
    name = "pgr",
    about = "Ticket-driven autonomous coding-agent orchestrator",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Working directory for the run
    #[arg(short, long, global = true, help = "Working directory for the run")]
    pub dir: Option<PathBuf>,

    /// Maximum loop iterations
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Consecutive no-change turns before a stagnation exit (0 disables)
    #[arg(long, global = true)]
    pub stagnation_limit: Option<u32>,

    /// Per-invocation executor timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Commit reported files when the agent did not
    #[arg(long, global = true)]
    pub auto_commit: bool,

    /// Branch to check out before the loop starts
    #[arg(long, global = true)]
    pub branch: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the loop for a ticket id or plan file
    Start {
        /// Ticket id, or path to a plan file
        id: String,
    },

    /// Run the loop for an ad-hoc prompt (no phases)
    Run {
        /// Task description
        prompt: String,
    },

    /// Run the review pipeline (and fix passes) over current changes
    Review {
        /// Only count issues with these severities
        #[arg(long, value_delimiter = ',')]
        severities: Vec<String>,
    },

    /// Show the active session, if any
    Status,

    /// Manage plan files
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Plan management subcommands
#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    /// Scaffold a new plan file from a description
    Create {
        /// What the plan should accomplish; semicolons split phases
        description: String,

        /// Output path (default: plans/<slug>.md)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Configuration subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show,
}
