//! Command-line argument parsing for the `kherimoya` tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Manage Minecraft Bedrock servers run through endstone
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// A default configuration is written here if the file does not exist.
    #[arg(short, long, value_name = "FILE", default_value = "kherimoya.toml")]
    pub config: PathBuf,

    /// Root directory holding the `servers` directory
    ///
    /// Overrides `registry.root` from the configuration file.
    #[arg(short, long, value_name = "ROOT")]
    pub root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List every server
    List,

    /// Create a server and run its first-time installation
    Create {
        /// Name of the new server
        name: String,

        /// Seconds to wait for installation, overriding the configuration
        #[arg(long, value_name = "SECS", conflicts_with = "no_timeout")]
        install_timeout: Option<u64>,

        /// Wait for installation without a time limit
        #[arg(long)]
        no_timeout: bool,
    },

    /// Delete a server and all of its files
    Delete {
        /// Identifier of the server
        id: String,
    },

    /// Rename a server, keeping its identifier
    Rename {
        /// Identifier of the server
        id: String,
        /// New name
        new_name: String,
    },

    /// Start a server
    Start {
        /// Identifier of the server
        id: String,
    },

    /// Ask a server to stop
    Stop {
        /// Identifier of the server
        id: String,
    },

    /// Show details about a server
    Info {
        /// Identifier of the server
        id: String,
    },

    /// Give fresh identifiers to servers sharing one
    ResolveConflicts,
}
