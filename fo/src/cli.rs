//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// Fanout - scatter-gather messaging between cluster instances
#[derive(Parser)]
#[command(
    name = "fanout",
    about = "Scatter-gather request/reply across sibling cluster instances",
    version = env!("CARGO_PKG_VERSION"),
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

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a scatter-gather call across an in-process cluster
    Demo {
        /// Number of sibling instances to start
        #[arg(short = 'n', long, default_value_t = 3)]
        instances: u32,

        /// Name shared by the siblings
        #[arg(long, default_value = "svc")]
        name: String,

        /// Topic to request
        #[arg(short, long, default_value = "ping")]
        topic: String,

        /// Aggregation timeout in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Number of instances (counted from the last) that register no handler
        #[arg(long, default_value_t = 0)]
        silent: u32,

        /// Call from an unmanaged client instead of instance 0
        #[arg(long)]
        unmanaged: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the identity resolved from the environment
    Identity {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective configuration
    Config,
}

/// Output format for demo/identity commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use text or json", s)),
        }
    }
}
