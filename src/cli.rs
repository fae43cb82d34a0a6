// src/cli.rs
//! CLI definitions for ondemand
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.
//!
//! Every command runs against the in-process simulated backend, seeded with
//! the modules passed through `--installed`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ondemand")]
#[command(version)]
#[command(about = "On-demand module delivery with install tracking and confirmation gates", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print session snapshots as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a module, installing it first if needed
    Install {
        /// Module identifier
        module: String,

        /// Modules already installed on the simulated device
        #[arg(long, value_delimiter = ',')]
        installed: Vec<String>,

        /// Simulated module size in bytes
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        size: u64,

        /// Bytes per progress event
        #[arg(long, default_value_t = 1024 * 1024)]
        chunk: u64,

        /// Delay between backend events in milliseconds
        #[arg(long, default_value_t = 50)]
        step_ms: u64,

        /// Pause on a confirmation gate and answer it this way
        #[arg(long, value_enum)]
        confirm: Option<ConfirmChoice>,

        /// Fail the download with this platform error code
        #[arg(long, allow_hyphen_values = true)]
        fail: Option<i32>,
    },

    /// Schedule removal of installed modules
    Uninstall {
        /// Module identifiers
        #[arg(required = true)]
        modules: Vec<String>,

        /// Modules installed on the simulated device
        #[arg(long, value_delimiter = ',')]
        installed: Vec<String>,
    },

    /// Serve the HTTP/SSE API
    #[cfg(feature = "server")]
    Serve {
        /// Address to bind (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Modules installed on the simulated device
        #[arg(long, value_delimiter = ',')]
        installed: Vec<String>,
    },
}

/// Answer for a confirmation gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfirmChoice {
    Approve,
    Deny,
}

impl ConfirmChoice {
    pub fn approves(self) -> bool {
        self == Self::Approve
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install() {
        let cli = Cli::try_parse_from([
            "ondemand",
            "--json",
            "install",
            "m1",
            "--installed",
            "m2,m3",
            "--confirm",
            "deny",
            "--fail",
            "-6",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Install {
                module,
                installed,
                confirm,
                fail,
                ..
            } => {
                assert_eq!(module, "m1");
                assert_eq!(installed, vec!["m2", "m3"]);
                assert_eq!(confirm, Some(ConfirmChoice::Deny));
                assert_eq!(fail, Some(-6));
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_uninstall_requires_modules() {
        assert!(Cli::try_parse_from(["ondemand", "uninstall"]).is_err());
    }
}
