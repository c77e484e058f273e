//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keygate - time-bounded access keys with seat limits and a blacklist
#[derive(Parser, Debug)]
#[command(name = "keygate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KEYGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "KEYGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "KEYGATE_HOST")]
    pub host: Option<String>,

    /// Directory holding the JSON collections
    #[arg(long, env = "KEYGATE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KEYGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KEYGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve,

    /// Inspect or clean the key collection
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Inspect the blacklist
    #[command(subcommand)]
    Bans(BansCommand),
}

/// Key subcommands
#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List every stored key
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete expired keys
    Purge,
}

/// Blacklist subcommands
#[derive(Subcommand, Debug)]
pub enum BansCommand {
    /// List every ban, including lapsed ones
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}
