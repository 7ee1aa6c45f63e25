// src/commands.rs
//! Command handlers for the autobuild CLI

use anyhow::{Context, Result, bail};
use autobuild::build::{Submission, UploadOptions};
use autobuild::config::Config;
use autobuild::daemon::{Command, CommandOutput, Daemon, InstanceLock, ResourceRef, Services};
use autobuild::db::{self, Store};
use autobuild::repository::DistributionString;
use autobuild::status::{Operation, ResourceKind};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often the serving daemon looks for spooled submissions
const INTAKE_INTERVAL: Duration = Duration::from_secs(5);

fn load(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Lock the instance and wire up a daemon over its database
fn open_daemon(config: Config) -> Result<(InstanceLock, Daemon)> {
    let lock = InstanceLock::require(config.daemon.lock_path())?;
    let store = Arc::new(Store::open(config.daemon.db_path())?);
    let services = Services::system(&config)?;
    let daemon = Daemon::new(config, store, services)?;
    Ok((lock, daemon))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn cmd_init(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let daemon = &config.daemon;
    for dir in [
        daemon.base_dir.clone(),
        daemon.log_dir(),
        daemon.spool_dir(),
        daemon.chroots_dir(),
    ] {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    db::init(daemon.db_path())?;
    println!("Initialized {} at {}", daemon.identity, daemon.base_dir.display());
    Ok(())
}

pub fn cmd_check_config(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    println!("{}: configuration OK", config_path.display());
    println!("  identity:      {}", config.daemon.identity);
    println!("  distributions: {}", config.distributions.len());
    println!("  repositories:  {}", config.repositories.len());
    println!("  chroots:       {}", config.chroots.len());
    println!("  sources:       {}", config.sources.len());
    println!("  peers:         {}", config.peers.len());
    Ok(())
}

pub async fn cmd_status(config_path: &Path) -> Result<()> {
    let (_lock, daemon) = open_daemon(load(config_path)?)?;
    let listing = daemon.resources().await;
    if listing.is_empty() {
        println!("No managed resources configured.");
        return Ok(());
    }
    for entry in listing {
        let mut line = format!("{:<12} {:<40} {}", entry.kind, entry.key, entry.record.describe());
        if entry.needs_recheck {
            line.push_str("  [recheck due]");
        }
        if let Some(error) = &entry.record.last_error {
            line.push_str(&format!("  last error: {}", error));
        }
        println!("{}", line);
    }
    Ok(())
}

pub async fn cmd_resource(config_path: &Path, operation: &str, kind: &str, key: &str) -> Result<()> {
    let op: Operation = operation
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown operation {}", operation))?;
    let kind: ResourceKind = kind
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown resource kind {}", kind))?;
    let (_lock, daemon) = open_daemon(load(config_path)?)?;
    let command = Command::Status {
        op,
        resource: ResourceRef::new(kind, key),
    };
    print_output(daemon.execute(command, None).await?)
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_submit(
    config_path: &Path,
    dsc: PathBuf,
    package: &str,
    version: &str,
    distribution: &str,
    arch: &[String],
    component: &str,
    options: &[String],
) -> Result<()> {
    let config = load(config_path)?;
    if !dsc.is_file() {
        bail!("{} does not exist", dsc.display());
    }
    let dsc = dsc.canonicalize()?;
    let arch: Vec<&str> = arch.iter().map(String::as_str).collect();
    let mut submission = Submission::new(
        package,
        version,
        config.resolve_distribution(distribution)?,
        &arch,
        dsc,
    );
    submission.component = component.to_string();
    submission.options = UploadOptions::parse(options)?;

    let path = Daemon::enqueue(&config.daemon.spool_dir(), &submission)?;
    println!("Queued {} ({})", submission, path.display());
    Ok(())
}

/// Spool a cancellation for the running daemon to pick up
pub fn cmd_cancel(config_path: &Path, key: &str) -> Result<()> {
    let config = load(config_path)?;
    let path = Daemon::request_cancel(&config.daemon.spool_dir(), key)?;
    println!("Cancellation of {} requested ({})", key, path.display());
    Ok(())
}

pub fn cmd_history(config_path: &Path, limit: i64) -> Result<()> {
    let config = load(config_path)?;
    let store = Store::open(config.daemon.db_path())?;
    let rows = store.with(|conn| autobuild::db::models::SubmissionRow::list_recent(conn, limit))?;
    if rows.is_empty() {
        println!("No submissions.");
        return Ok(());
    }
    for row in rows {
        println!(
            "{:>5}  {}  {} {} -> {}  {}{}",
            row.id.unwrap_or_default(),
            row.received_at,
            row.package,
            row.version,
            row.distribution,
            row.status,
            row.reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn cmd_report(config_path: &Path, package: &str, version: &str) -> Result<()> {
    let (_lock, daemon) = open_daemon(load(config_path)?)?;
    print_json(&daemon.report(package, version)?)
}

pub async fn cmd_execute(config_path: &Path, command: Command, confirm: Option<&str>) -> Result<()> {
    // fail fast, before locking the instance
    command.confirm(confirm)?;
    let (_lock, daemon) = open_daemon(load(config_path)?)?;
    print_output(daemon.execute(command, confirm).await?)
}

pub fn parse_dist(text: &str) -> Result<DistributionString> {
    Ok(text.parse()?)
}

fn print_output(output: CommandOutput) -> Result<()> {
    match &output {
        CommandOutput::Status { resource, record } => {
            println!("{}: {}", resource, record.describe());
            if let Some(error) = &record.last_error {
                println!("  last error: {}", error);
            }
            Ok(())
        }
        _ => print_json(&output),
    }
}

/// Run until interrupted: recovery, spool intake, housekeeping, peer endpoint
pub async fn cmd_serve(config_path: &Path, interval: u64) -> Result<()> {
    let (_lock, daemon) = open_daemon(load(config_path)?)?;
    let daemon = Arc::new(daemon);
    daemon.refresh_peers().await;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[serve] interrupt received, shutting down");
            }
            shutdown.cancel();
        });
    }

    {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            match daemon.recover().await {
                Ok(reports) if !reports.is_empty() => {
                    info!("[serve] recovered {} submission(s)", reports.len())
                }
                Ok(_) => {}
                Err(e) => warn!("[serve] recovery failed: {}", e),
            }
        });
    }

    #[cfg(feature = "server")]
    let server = {
        let token = shutdown.clone();
        tokio::spawn(autobuild::server::run_server(daemon.clone(), async move {
            token.cancelled().await
        }))
    };
    #[cfg(not(feature = "server"))]
    warn!("[serve] built without the server feature, not serving peers");

    let mut housekeeping = tokio::time::interval(Duration::from_secs(interval.max(1)));
    let mut intake = tokio::time::interval(INTAKE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = housekeeping.tick() => {
                if let Err(e) = daemon.maintain(Utc::now()).await {
                    warn!("[serve] housekeeping failed: {}", e);
                }
            }
            _ = intake.tick() => {
                for key in daemon.take_cancel_requests() {
                    match daemon.execute(Command::Cancel { key: key.clone() }, None).await {
                        Ok(CommandOutput::Cancelled { submission: Some(id), .. }) => {
                            info!("[serve] cancelled {} (submission {})", key, id)
                        }
                        Ok(_) => info!("[serve] {} is not building", key),
                        Err(e) => warn!("[serve] cancelling {} failed: {}", key, e),
                    }
                }
                for submission in daemon.take_incoming() {
                    let daemon = daemon.clone();
                    tokio::spawn(async move {
                        match daemon.submit(submission).await {
                            Ok(report) => info!(
                                "[serve] {} {} -> {}: {}",
                                report.package, report.version, report.distribution, report.status
                            ),
                            Err(e) => warn!("[serve] submission failed: {}", e),
                        }
                    });
                }
            }
        }
    }

    #[cfg(feature = "server")]
    server.await??;
    Ok(())
}
