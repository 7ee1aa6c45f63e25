// src/daemon/commands.rs

//! Operator commands
//!
//! Every command is idempotent. Commands that change what a repository
//! publishes (migrate, remove, port) only run when the caller repeats the
//! command name as confirmation.

use crate::daemon::PackageReport;
use crate::error::{Error, Result};
use crate::repository::{DistributionString, MigrationOutcome, RepositoryEntry};
use crate::status::{Operation, ResourceKind, StatusRecord};
use serde::Serialize;
use std::fmt;

/// Names one managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub key: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, key: &str) -> Self {
        Self {
            kind,
            key: key.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Prepare, Check, Activate, Deactivate or Remove a managed resource
    Status { op: Operation, resource: ResourceRef },
    /// Move a package to the next suite, or restore it from `-rollbackN`
    Migrate {
        package: String,
        distribution: DistributionString,
    },
    /// Take a package out of a distribution (or drop a rollback entry)
    RemovePackage {
        package: String,
        distribution: DistributionString,
    },
    /// Rebuild the active version of a package for other distributions
    Port {
        package: String,
        from: DistributionString,
        to: Vec<DistributionString>,
    },
    /// Run automatic migrations that are due
    AutoMigrate,
    /// Stop every job of a building submission, `<package>_<version>`
    Cancel { key: String },
    /// Versions of a package in every distribution, rollbacks included
    Show { package: String },
    /// Submit a failed or rejected submission again, `<package>_<version>`
    Retry { key: String },
}

impl Command {
    pub fn name(&self) -> String {
        match self {
            Command::Status { op, .. } => op.to_string(),
            Command::Migrate { .. } => "migrate".to_string(),
            Command::RemovePackage { .. } => "remove".to_string(),
            Command::Port { .. } => "port".to_string(),
            Command::AutoMigrate => "auto-migrate".to_string(),
            Command::Cancel { .. } => "cancel".to_string(),
            Command::Show { .. } => "show".to_string(),
            Command::Retry { .. } => "retry".to_string(),
        }
    }

    pub fn requires_confirm(&self) -> bool {
        matches!(
            self,
            Command::Migrate { .. }
                | Command::RemovePackage { .. }
                | Command::Port { .. }
                | Command::Retry { .. }
        )
    }

    /// The confirmation token must equal the command name
    pub fn confirm(&self, token: Option<&str>) -> Result<()> {
        let name = self.name();
        if !self.requires_confirm() || token == Some(name.as_str()) {
            Ok(())
        } else {
            Err(Error::ConfirmationRequired(name))
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Status { op, resource } => write!(f, "{} {}", op, resource),
            Command::Migrate {
                package,
                distribution,
            }
            | Command::RemovePackage {
                package,
                distribution,
            } => write!(f, "{} {} {}", self.name(), package, distribution),
            Command::Port { package, from, to } => {
                let targets: Vec<String> = to.iter().map(|d| d.to_string()).collect();
                write!(f, "port {} {} -> {}", package, from, targets.join(","))
            }
            Command::AutoMigrate => f.write_str("auto-migrate"),
            Command::Cancel { key } | Command::Retry { key } => write!(f, "{} {}", self.name(), key),
            Command::Show { package } => write!(f, "show {}", package),
        }
    }
}

/// What a command did
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum CommandOutput {
    Status {
        resource: ResourceRef,
        record: StatusRecord,
    },
    Migrated {
        outcome: MigrationOutcome,
    },
    Removed {
        entry: Option<RepositoryEntry>,
    },
    Ported {
        reports: Vec<PackageReport>,
    },
    AutoMigrated {
        outcomes: Vec<MigrationOutcome>,
    },
    /// `submission` is set when a building submission was told to stop
    Cancelled {
        key: String,
        submission: Option<i64>,
    },
    Shown {
        package: String,
        distributions: Vec<PackageRing>,
    },
    Retried {
        report: PackageReport,
    },
}

/// One distribution's view of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRing {
    pub distribution: String,
    pub active: Option<RepositoryEntry>,
    /// Slot 0 first
    pub rollbacks: Vec<RepositoryEntry>,
}

/// Split a submission key `<package>_<version>`
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('_') {
        Some((package, version))
            if !package.is_empty() && !version.is_empty() && !key.contains('/') =>
        {
            Ok((package, version))
        }
        _ => Err(Error::ParseError(format!(
            "submission key '{}': expected <package>_<version>",
            key
        ))),
    }
}
