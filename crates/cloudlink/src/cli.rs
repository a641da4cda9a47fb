//! Clap derive structures for the `cloudlink` agent.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// cloudlink -- game server link to the EchoCloud backend
#[derive(Debug, Parser)]
#[command(
    name = "cloudlink",
    version,
    about = "Keep a game server connected to its EchoCloud fleet backend",
    long_about = "Maintains the websocket or pub/sub link between one game server and\n\
        the EchoCloud backend: answers heartbeat requests, forwards player\n\
        activity and announces shutdown.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Settings file (default: platform config directory)
    #[arg(long, short = 'c', env = "CLOUDLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect and stay linked until interrupted
    Run(RunArgs),

    /// Forward one player activity record
    Log(LogArgs),

    /// Manage the settings file
    Config(ConfigArgs),

    /// Read and write backend key/value storage
    Storage(StorageArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Player capacity reported in heartbeat responses
    #[arg(long, default_value_t = 20)]
    pub max_players: u32,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Player name
    pub player: String,

    /// Player UUID
    pub uuid: String,

    /// Activity, e.g. join, leave, switch
    pub action: String,

    /// Mark the activity as forced by the server
    #[arg(long)]
    pub forced: bool,

    /// Seconds to wait for the link and for delivery
    #[arg(long, default_value_t = 10)]
    pub wait: u64,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a fresh settings file
    Init {
        /// Server id (default: derived from the working directory)
        #[arg(long)]
        server_id: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective settings, secrets masked
    Show,

    /// Print the settings file path
    Path,

    /// Check the settings without connecting
    Validate,
}

#[derive(Debug, Args)]
pub struct StorageArgs {
    #[command(subcommand)]
    pub command: StorageCommand,
}

#[derive(Debug, Subcommand)]
pub enum StorageCommand {
    /// Print the value stored under a key
    Get { key: String },

    /// Store a JSON value under a key
    Put {
        key: String,
        /// JSON value, e.g. '{"motd":"hi"}' or '"text"'
        value: String,
    },

    /// Delete a key
    Delete { key: String },
}
