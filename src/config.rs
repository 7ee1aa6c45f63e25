// src/config.rs
//! Configuration file parsing for the autobuild daemon
//!
//! TOML sections:
//! - [daemon] - Instance identity and directories
//! - [pool] - Chroot session bounds and lease timing
//! - [build] - Job timeouts and retry policy
//! - [federation] - Peer selection and circuit breaking
//! - [status] - Resource recheck interval
//! - [[distributions]], [[layouts]], [[repositories]], [[chroots]],
//!   [[sources]], [[peers]] - Managed resources
//!
//! The loaded [`Config`] is handed to each component at construction; nothing
//! here is process-global.

use crate::chroot::ChrootConfig;
use crate::error::{Error, Result};
use crate::federation::{PeerConfig, SelectionStrategy};
use crate::repository::{Distribution, DistributionString, Layout, RepositoryConfig, resolve_distribution};
use crate::source::SourceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub build: BuildSection,

    #[serde(default)]
    pub federation: FederationSection,

    #[serde(default)]
    pub status: StatusSection,

    #[serde(default)]
    pub distributions: Vec<Distribution>,

    /// Extra layouts; the default layout is always available
    #[serde(default)]
    pub layouts: Vec<Layout>,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub chroots: Vec<ChrootConfig>,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Instance identity and directories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Identity announced to peers
    #[serde(default = "default_identity")]
    pub identity: String,

    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Defaults to `<base_dir>/autobuild.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Defaults to `<base_dir>/log`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Defaults to `<base_dir>/spool`
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    #[serde(default = "default_schroot_conf_dir")]
    pub schroot_conf_dir: PathBuf,

    /// Run chroot maintenance commands through `sudo -n`
    #[serde(default = "default_true")]
    pub use_sudo: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            base_dir: default_base_dir(),
            db_path: None,
            log_dir: None,
            spool_dir: None,
            schroot_conf_dir: default_schroot_conf_dir(),
            use_sudo: true,
        }
    }
}

impl DaemonSection {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("autobuild.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.base_dir.join("log"))
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("spool"))
    }

    pub fn chroots_dir(&self) -> PathBuf {
        self.base_dir.join("chroots")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("autobuild.lock")
    }
}

fn default_identity() -> String {
    "autobuild".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/autobuild")
}

fn default_schroot_conf_dir() -> PathBuf {
    PathBuf::from("/etc/schroot/chroot.d")
}

fn default_true() -> bool {
    true
}

/// Chroot session pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Concurrent sessions per (codename, architecture)
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_chroot: usize,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Sessions older than this are reaped
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_sessions_per_chroot: default_max_sessions(),
            acquire_timeout_secs: default_acquire_timeout(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl PoolSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

fn default_max_sessions() -> usize {
    2
}

fn default_acquire_timeout() -> u64 {
    600
}

fn default_lease_ttl() -> u64 {
    6 * 3600
}

/// Build job policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Retries after a timeout, each on a different worker
    #[serde(default = "default_one")]
    pub timeout_retries: u32,

    /// Session re-acquisitions after a builder failed to start
    #[serde(default = "default_one")]
    pub start_retries: u32,

    #[serde(default = "default_capacity_retries")]
    pub capacity_retries: u32,

    #[serde(default = "default_capacity_retry_delay")]
    pub capacity_retry_delay_ms: u64,

    /// `parallel=` value in DEB_BUILD_OPTIONS
    #[serde(default = "default_one")]
    pub sbuild_jobs: u32,

    #[serde(default = "default_sbuild_command")]
    pub sbuild_command: String,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout(),
            timeout_retries: 1,
            start_retries: 1,
            capacity_retries: default_capacity_retries(),
            capacity_retry_delay_ms: default_capacity_retry_delay(),
            sbuild_jobs: 1,
            sbuild_command: default_sbuild_command(),
        }
    }
}

impl BuildSection {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn capacity_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capacity_retry_delay_ms)
    }
}

fn default_job_timeout() -> u64 {
    4 * 3600
}

fn default_one() -> u32 {
    1
}

fn default_capacity_retries() -> u32 {
    3
}

fn default_capacity_retry_delay() -> u64 {
    30_000
}

fn default_sbuild_command() -> String {
    "sbuild".to_string()
}

/// Remote peer handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationSection {
    #[serde(default)]
    pub selection: SelectionStrategy,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Consecutive network failures before a peer is suspect
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long a suspect peer is skipped
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Address the peer endpoint listens on (`serve`)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Token inbound peer requests must carry; unset accepts any peer
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for FederationSection {
    fn default() -> Self {
        Self {
            selection: SelectionStrategy::default(),
            request_timeout_secs: default_request_timeout(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            listen: default_listen(),
            token: None,
        }
    }
}

impl FederationSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    60
}

fn default_listen() -> String {
    "0.0.0.0:8066".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSection {
    /// Prepared resources unchecked for this many days are checked again
    #[serde(default = "default_recheck_days")]
    pub recheck_days: i64,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            recheck_days: default_recheck_days(),
        }
    }
}

fn default_recheck_days() -> i64 {
    6
}

impl Config {
    /// Read, parse and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Configured layouts plus the default layout (unless overridden by name)
    pub fn layouts(&self) -> Vec<Layout> {
        let default = Layout::default_layout();
        let mut layouts = self.layouts.clone();
        if !layouts.iter().any(|l| l.name == default.name) {
            layouts.push(default);
        }
        layouts
    }

    pub fn layout(&self, name: &str) -> Option<Layout> {
        self.layouts().into_iter().find(|l| l.name == name)
    }

    pub fn distribution(&self, codename: &str) -> Option<&Distribution> {
        self.distributions.iter().find(|d| d.codename == codename)
    }

    /// Resolve an upload target, expanding meta-distribution aliases over
    /// the configured repositories
    pub fn resolve_distribution(&self, name: &str) -> Result<DistributionString> {
        let layouts: Vec<(&RepositoryConfig, Layout)> = self
            .repositories
            .iter()
            .filter_map(|rc| self.layout(&rc.layout).map(|layout| (rc, layout)))
            .collect();
        let candidates: Vec<(&str, &Layout, &[String])> = layouts
            .iter()
            .map(|(rc, layout)| (rc.identity.as_str(), layout, rc.distributions.as_slice()))
            .collect();
        resolve_distribution(name, &candidates)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_word(&self.daemon.identity) {
            return Err(Error::Config(format!(
                "identity {:?} must be non-empty word characters",
                self.daemon.identity
            )));
        }
        if self.pool.max_sessions_per_chroot == 0 {
            return Err(Error::Config("pool.max_sessions_per_chroot must be at least 1".into()));
        }
        if self.pool.lease_ttl_secs <= self.build.job_timeout_secs {
            return Err(Error::Config(format!(
                "pool.lease_ttl_secs ({}) must exceed build.job_timeout_secs ({})",
                self.pool.lease_ttl_secs, self.build.job_timeout_secs
            )));
        }

        let mut codenames = HashSet::new();
        for dist in &self.distributions {
            if !codenames.insert(dist.codename.as_str()) {
                return Err(Error::Config(format!("duplicate distribution {}", dist.codename)));
            }
            dist.validate()?;
        }

        let layouts = self.layouts();
        let mut names = HashSet::new();
        for layout in &layouts {
            if !names.insert(layout.name.as_str()) {
                return Err(Error::Config(format!("duplicate layout {}", layout.name)));
            }
            layout.validate()?;
        }

        let mut identities = HashSet::new();
        for repo in &self.repositories {
            if !is_word(&repo.identity) {
                return Err(Error::Config(format!(
                    "repository identity {:?} must be word characters",
                    repo.identity
                )));
            }
            if !identities.insert(repo.identity.as_str()) {
                return Err(Error::Config(format!("duplicate repository {}", repo.identity)));
            }
            let layout = layouts.iter().find(|l| l.name == repo.layout).ok_or_else(|| {
                Error::Config(format!(
                    "repository {}: unknown layout {}",
                    repo.identity, repo.layout
                ))
            })?;
            for codename in &repo.distributions {
                let dist = self.distribution(codename).ok_or_else(|| {
                    Error::Config(format!(
                        "repository {}: unknown distribution {}",
                        repo.identity, codename
                    ))
                })?;
                for suite in &layout.suites {
                    layout.version_restriction(suite, &repo.identity, &dist.base_version)?;
                }
            }
        }

        let mut chroots = HashSet::new();
        for chroot in &self.chroots {
            if self.distribution(&chroot.codename).is_none() {
                return Err(Error::Config(format!(
                    "chroot {}: unknown distribution {}",
                    chroot.name(),
                    chroot.codename
                )));
            }
            if !chroots.insert((chroot.codename.as_str(), chroot.architecture.as_str())) {
                return Err(Error::Config(format!("duplicate chroot {}", chroot.name())));
            }
        }

        for source in &self.sources {
            source.validate()?;
        }

        let mut endpoints = HashSet::new();
        for peer in &self.peers {
            peer.validate()?;
            if !endpoints.insert(peer.endpoint.as_str()) {
                return Err(Error::Config(format!("duplicate peer {}", peer.endpoint)));
            }
        }

        Ok(())
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
