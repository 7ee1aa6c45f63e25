// src/cli.rs
//! CLI definitions for the autobuild binary
//!
//! The command implementations live in the `commands` module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autobuild")]
#[command(author, version)]
#[command(about = "Autobuilder and package repository manager", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "/etc/autobuild/autobuild.toml")]
    pub config: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and instance directories
    Init,

    /// Load and validate the configuration
    CheckConfig,

    /// List managed resources with their status
    Status,

    /// Run a status operation on a managed resource
    Resource {
        /// prepare, check, activate, deactivate or remove
        operation: String,

        /// chroot, repository, source or remote-peer
        kind: String,

        /// Resource key, e.g. mbd-sid-amd64
        key: String,
    },

    /// Build and install a source package
    Submit {
        /// Path to the .dsc file
        dsc: PathBuf,

        #[arg(long)]
        package: String,

        #[arg(long)]
        version: String,

        /// Target distribution, e.g. sid-test-unstable
        #[arg(short, long)]
        distribution: String,

        /// Architectures to build (any, all or concrete names)
        #[arg(short, long, value_delimiter = ',', default_value = "any")]
        arch: Vec<String>,

        #[arg(long, default_value = "main")]
        component: String,

        /// Upload option, key[alt]=value (repeatable)
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
    },

    /// Show recent submissions
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },

    /// Show the per-architecture report of a submission
    Report {
        package: String,
        version: String,
    },

    /// Migrate a package to the next suite, or restore it from -rollbackN
    Migrate {
        package: String,
        distribution: String,

        /// Repeat the command name to confirm
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Remove a package from a distribution
    Remove {
        package: String,
        distribution: String,

        /// Repeat the command name to confirm
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Rebuild the active version of a package for other distributions
    Port {
        package: String,
        from: String,

        /// Target distributions
        #[arg(required = true)]
        to: Vec<String>,

        /// Repeat the command name to confirm
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Run automatic migrations that are due
    AutoMigrate,

    /// Stop a building submission in the running daemon
    Cancel {
        /// Submission key, <package>_<version>
        key: String,
    },

    /// Show the versions of a package in every distribution, with rollbacks
    Show { package: String },

    /// Submit a failed or rejected submission again
    Retry {
        /// Submission key, <package>_<version>
        key: String,

        /// Repeat the command name to confirm
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Run the daemon: recovery, housekeeping and the peer endpoint
    Serve {
        /// Seconds between housekeeping passes
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "autobuild",
            "submit",
            "/incoming/foo_1.0-1.dsc",
            "--package",
            "foo",
            "--version",
            "1.0-1",
            "-d",
            "sid-test-unstable",
            "-a",
            "amd64,armel",
            "-o",
            "ignore-lintian[armel]=true",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit { arch, options, .. } => {
                assert_eq!(arch, vec!["amd64", "armel"]);
                assert_eq!(options, vec!["ignore-lintian[armel]=true"]);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_parse_cancel_and_retry() {
        let cli = Cli::try_parse_from(["autobuild", "cancel", "foo_1.0-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Cancel { ref key } if key == "foo_1.0-1"));

        let cli = Cli::try_parse_from(["autobuild", "retry", "foo_1.0-1", "--confirm", "retry"]).unwrap();
        match cli.command {
            Commands::Retry { key, confirm } => {
                assert_eq!(key, "foo_1.0-1");
                assert_eq!(confirm.as_deref(), Some("retry"));
            }
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn test_port_needs_targets() {
        assert!(Cli::try_parse_from(["autobuild", "port", "foo", "sid-test-unstable"]).is_err());
    }
}
