//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the wxrelay binary.

use clap::{Parser, Subcommand};

/// wxrelay - role-based weather/actuator relay
///
/// One binary, four roles: the relay broker, the device endpoint with its
/// named-pipe bridge, the weather provider, and the operator console.
#[derive(Parser, Debug)]
#[command(name = "wxrelay")]
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

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay broker
    Broker {
        /// Path to configuration file
        #[arg(short, long, env = "WXRELAY_CONFIG")]
        config: Option<String>,

        /// Override the bind address
        #[arg(long)]
        bind: Option<String>,

        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the device endpoint with its named-pipe bridge
    Device {
        /// Path to configuration file
        #[arg(short, long, env = "WXRELAY_CONFIG")]
        config: Option<String>,

        /// Override the broker host
        #[arg(long)]
        server: Option<String>,

        /// Override the broker port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the pipe directory
        #[arg(long)]
        pipe_dir: Option<String>,
    },

    /// Run the weather provider
    Provider {
        /// Path to configuration file
        #[arg(short, long, env = "WXRELAY_CONFIG")]
        config: Option<String>,

        /// Override the broker host
        #[arg(long)]
        server: Option<String>,

        /// Override the broker port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the default city
        #[arg(long)]
        city: Option<String>,

        /// Override the weather API key
        #[arg(long, env = "WXRELAY_API_KEY")]
        api_key: Option<String>,
    },

    /// Run the interactive operator console
    Console {
        /// Path to configuration file
        #[arg(short, long, env = "WXRELAY_CONFIG")]
        config: Option<String>,

        /// Override the broker host
        #[arg(long)]
        server: Option<String>,

        /// Override the broker port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Display version and build information
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
