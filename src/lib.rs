// src/lib.rs

//! autobuild: autobuilder and package repository manager
//!
//! Source uploads are built for every architecture of their distribution in
//! leased chroot sessions, locally or on federated peer instances, and the
//! results are installed into suite-structured repositories with bounded
//! rollback history.
//!
//! # Architecture
//!
//! - Status tracker: one state machine for chroots, repositories, sources
//!   and peers
//! - Chroot pool: bounded, leased build sessions per (codename, arch)
//! - Build coordinator: one task per architecture, timeouts, retries and
//!   peer fallback, joined into one outcome
//! - Repository: rollback rings per (package, distribution), migration,
//!   ports and automatic promotion
//! - Daemon: the package pipeline and operator commands
//! - Everything durable lives in SQLite

pub mod build;
pub mod chroot;
pub mod config;
pub mod daemon;
pub mod db;
mod error;
pub mod federation;
pub mod repository;
pub mod source;
pub mod status;

#[cfg(feature = "server")]
pub mod server;

pub use build::{BuildOutcome, BuildResult, JobState, OutcomeState, ResultKind, Submission};
pub use config::Config;
pub use daemon::{Daemon, PackageReport, PackageStatus};
pub use error::{Error, Result};
pub use repository::{DistributionString, Repository, RepositoryEntry};
pub use status::{Operation, ResourceKind, Status, StatusRecord};
