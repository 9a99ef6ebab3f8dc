//! CLI command definitions.
//!
//! Editor plugins call `heartline heartbeat` on activity. Everything else is
//! for users inspecting or flushing the offline queue.

use super::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Heartline CLI - developer activity heartbeats with offline queueing.
#[derive(Parser)]
#[command(name = "heartline")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Verbose logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Write logs to stderr instead of the log file
    #[arg(long = "log-to-stdout", global = true)]
    pub log_to_stdout: bool,

    /// Config file (defaults to <data dir>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show version information
    Version,

    /// Send a heartbeat, queueing it offline if delivery fails
    Heartbeat(HeartbeatArgs),

    /// Send queued heartbeats
    Sync(SyncArgs),

    /// Offline queue inspection
    #[command(subcommand)]
    Offline(OfflineCommands),
}

#[derive(Args)]
pub struct HeartbeatArgs {
    /// File path, app name or domain
    #[arg(long)]
    pub entity: String,

    /// Entity type: file, app or domain
    #[arg(long = "entity-type", default_value = "file")]
    pub entity_type: String,

    /// Activity category, e.g. coding, debugging, "code reviewing"
    #[arg(long, default_value = "coding")]
    pub category: String,

    /// Unix timestamp with sub-second precision (defaults to now)
    #[arg(long)]
    pub time: Option<f64>,

    #[arg(long)]
    pub project: Option<String>,

    #[arg(long)]
    pub branch: Option<String>,

    #[arg(long)]
    pub language: Option<String>,

    /// The entity was saved
    #[arg(long, default_value_t = false)]
    pub write: bool,

    #[arg(long)]
    pub lineno: Option<u32>,

    #[arg(long)]
    pub cursorpos: Option<u32>,

    #[arg(long = "lines-in-file")]
    pub lines_in_file: Option<u32>,

    /// Editor plugin identifier, appended to the user agent
    #[arg(long)]
    pub plugin: Option<String>,

    /// API key (overrides config and environment)
    #[arg(long)]
    pub key: Option<String>,

    /// API base URL (overrides config and environment)
    #[arg(long = "api-url")]
    pub api_url: Option<String>,

    /// Read a JSON array of additional heartbeats from stdin
    #[arg(long = "extra-heartbeats", default_value_t = false)]
    pub extra_heartbeats: bool,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Ignore the rate limit
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Maximum heartbeats to send in this pass
    #[arg(long = "sync-max")]
    pub sync_max: Option<usize>,

    /// API key (overrides config and environment)
    #[arg(long)]
    pub key: Option<String>,

    /// API base URL (overrides config and environment)
    #[arg(long = "api-url")]
    pub api_url: Option<String>,
}

/// Offline queue subcommands.
#[derive(Subcommand)]
pub enum OfflineCommands {
    /// Print the number of queued heartbeats
    Count,
    /// List queued heartbeats in send order
    List(OfflineListArgs),
}

#[derive(Args)]
pub struct OfflineListArgs {
    /// Maximum entries to show
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}
