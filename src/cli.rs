//! Command-line interface for netloom
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// netloom - network emulator
#[derive(Parser)]
#[command(name = "netloom")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the privileged operation daemon (requires root)
    Daemon {
        /// Unix socket to listen on
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Run the RPC server for one project
    Server {
        /// Project archive to serve
        project: PathBuf,

        /// TCP port to listen on (loopback only)
        #[arg(short, long, default_value_t = 10100)]
        port: u16,

        /// Project identifier used as kernel resource prefix
        #[arg(long)]
        id: Option<String>,
    },

    /// Create an empty project archive
    Create {
        /// Path of the new project archive
        project: PathBuf,
    },

    /// Validate a project topology without activating it
    Check {
        /// Project archive to validate
        project: PathBuf,
    },

    /// Remove leftover kernel resources of a project
    Clean {
        /// Project identifier
        id: String,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        shell: Shell,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    }
}
