// src/daemon/mod.rs

//! The autobuild daemon
//!
//! Owns every managed resource of one instance and drives submissions
//! through the package pipeline:
//!
//! ```text
//! precheck -> record -> build (coordinator) -> install -> auto-ports -> report
//! ```
//!
//! Resource status operations are serialized through one lock, so Prepare
//! and Check never run concurrently on the same resource. After each
//! operation the pool's hosted chroots and the peer registry are brought in
//! line with what is Active.

pub mod commands;
pub mod lock;

pub use commands::{Command, CommandOutput, PackageRing, ResourceRef, split_key};
pub use lock::InstanceLock;

use crate::build::coordinator::DispatchPolicy;
use crate::build::{
    BuildJob, BuildOutcome, BuildResult, Builder, Coordinator, FailureReport, JobSpec, OutcomeState,
    ResultKind, SbuildBuilder, Submission, UploadOptions, plan_jobs,
};
use crate::chroot::{
    Chroot, ChrootKey, ChrootPool, CommandRunner, SchrootSessions, SessionProvider, SystemRunner,
};
use crate::config::Config;
use crate::db::Store;
use crate::db::models::{BuildJobRow, SubmissionRow};
use crate::error::{Error, Result};
use crate::federation::client::{HttpPeerClient, RemoteBuilder};
use crate::federation::protocol::{Advertisement, BuildRequest};
use crate::federation::{PeerRegistry, RemotePeer};
use crate::repository::version::compare_versions;
use crate::repository::{
    DistributionString, LayoutsInUse, MigrationOutcome, PromotionEngine, Repository,
    RepositoryEntry, RepositoryResource,
};
use crate::source::SourceArchive;
use crate::status::{ManagedResource, Operation, ResourceKind, Status, StatusRecord, Tracked};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mirror chroots bootstrap from when no source covers their codename
const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";

/// Spool subdirectory holding queued submissions
const INCOMING: &str = "incoming";

/// Spool subdirectory for cancellation requests
const CANCEL: &str = "cancel";

/// Where a submission is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PackageStatus {
    Rejected,
    Failed,
    Checking,
    Building,
    Installing,
    Installed,
}

impl PackageStatus {
    /// Numeric code; negative codes are failures
    pub fn code(self) -> i32 {
        match self {
            PackageStatus::Rejected => -1,
            PackageStatus::Failed => -2,
            PackageStatus::Checking => 0,
            PackageStatus::Building => 1,
            PackageStatus::Installing => 2,
            PackageStatus::Installed => 10,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            PackageStatus::Rejected | PackageStatus::Failed | PackageStatus::Installed
        )
    }
}

/// Result of one submission's trip through the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
    pub submission_id: Option<i64>,
    pub package: String,
    pub version: String,
    pub distribution: String,
    pub status: PackageStatus,
    pub outcome: Option<OutcomeState>,
    pub reason: Option<String>,
    pub installed: Option<RepositoryEntry>,
    /// Per-architecture logs when the build did not install
    pub failure: Option<FailureReport>,
    /// Reports of automatic ports triggered after install
    pub ports: Vec<PackageReport>,
}

impl PackageReport {
    fn new(submission_id: Option<i64>, package: &str, version: &str, distribution: &str) -> Self {
        Self {
            submission_id,
            package: package.to_string(),
            version: version.to_string(),
            distribution: distribution.to_string(),
            status: PackageStatus::Checking,
            outcome: None,
            reason: None,
            installed: None,
            failure: None,
            ports: Vec::new(),
        }
    }

    fn rejected(mut self, reason: String) -> Self {
        self.status = PackageStatus::Rejected;
        self.reason = Some(reason);
        self
    }
}

/// One line of a resource listing
#[derive(Debug, Clone, Serialize)]
pub struct ResourceListing {
    pub kind: ResourceKind,
    pub key: String,
    pub record: StatusRecord,
    pub needs_recheck: bool,
}

/// External collaborators the daemon drives
pub struct Services {
    pub runner: Arc<dyn CommandRunner>,
    pub sessions: Arc<dyn SessionProvider>,
    pub builder: Arc<dyn Builder>,
    pub remote: Arc<dyn RemoteBuilder>,
}

impl Services {
    /// schroot, sbuild and HTTP peers, as configured
    pub fn system(config: &Config) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner {
            use_sudo: config.daemon.use_sudo,
        });
        Ok(Self {
            sessions: Arc::new(SchrootSessions::new(runner.clone())),
            runner,
            builder: Arc::new(SbuildBuilder::new(&config.build, &config.daemon.base_dir)),
            remote: Arc::new(HttpPeerClient::new(
                &config.daemon.identity,
                config.federation.request_timeout(),
                config.daemon.base_dir.join("results").join("peers"),
            )?),
        })
    }
}

#[derive(Default)]
struct Resources {
    chroots: BTreeMap<String, Tracked<Chroot>>,
    repositories: BTreeMap<String, Tracked<RepositoryResource>>,
    sources: BTreeMap<String, Tracked<SourceArchive>>,
    peers: BTreeMap<String, Tracked<RemotePeer>>,
}

pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    pool: ChrootPool,
    peers: Arc<PeerRegistry>,
    builder: Arc<dyn Builder>,
    remote: Arc<dyn RemoteBuilder>,
    coordinator: Coordinator,
    promotion: PromotionEngine,
    repositories: BTreeMap<String, Arc<Repository>>,
    resources: tokio::sync::Mutex<Resources>,
    /// Builds run here on behalf of peers, by request id
    inbound: DashMap<String, CancellationToken>,
}

impl Daemon {
    /// Wire up all resources from `config`, restoring their persisted status
    pub fn new(config: Config, store: Arc<Store>, services: Services) -> Result<Self> {
        config.validate()?;
        let pool = ChrootPool::new(services.sessions.clone(), &config.pool);
        let peers = Arc::new(PeerRegistry::from_config(&config.federation));
        let coordinator = Coordinator::new(
            pool.clone(),
            services.builder.clone(),
            peers.clone(),
            services.remote.clone(),
            store.clone(),
            DispatchPolicy::from_config(&config.build, &config.pool),
        );

        let in_use = LayoutsInUse::default();
        let mut resources = Resources::default();
        let mut repositories = BTreeMap::new();

        for rc in &config.repositories {
            let layout = Arc::new(
                config
                    .layout(&rc.layout)
                    .ok_or_else(|| Error::Config(format!("unknown layout {}", rc.layout)))?,
            );
            let distributions = rc
                .distributions
                .iter()
                .map(|codename| {
                    config.distribution(codename).cloned().ok_or_else(|| {
                        Error::Config(format!("unknown distribution {}", codename))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let repo = Arc::new(Repository::new(
                &rc.identity,
                layout.clone(),
                distributions,
                store.clone(),
                &config.daemon.base_dir,
            ));
            let tracked = store.with(|conn| {
                Tracked::restore(RepositoryResource::new(repo.clone(), in_use.clone()), conn)
            })?;
            if tracked.record().status != Status::Removed {
                in_use.write().insert(rc.identity.clone(), layout);
            }
            resources.repositories.insert(tracked.key(), tracked);
            repositories.insert(rc.identity.clone(), repo);
        }

        for cc in &config.chroots {
            let mirror = config
                .sources
                .iter()
                .find(|s| s.codename == cc.codename)
                .and_then(|s| s.primary_mirror())
                .unwrap_or(DEFAULT_MIRROR);
            let chroot = Chroot::new(
                cc.clone(),
                &config.daemon.chroots_dir(),
                &config.daemon.schroot_conf_dir,
                mirror,
                services.runner.clone(),
            );
            let tracked = store.with(|conn| Tracked::restore(chroot, conn))?;
            if tracked.is_active() {
                pool.host(cc.key(), &cc.name(), cc.backend.kind());
            }
            resources.chroots.insert(tracked.key(), tracked);
        }

        for sc in &config.sources {
            let source = SourceArchive::new(sc.clone())?;
            let tracked = store.with(|conn| Tracked::restore(source, conn))?;
            resources.sources.insert(tracked.key(), tracked);
        }

        for pc in &config.peers {
            let peer = RemotePeer::new(pc.clone(), services.remote.clone(), peers.clone());
            let tracked = store.with(|conn| Tracked::restore(peer, conn))?;
            if tracked.record().status != Status::Removed {
                peers.register(pc.endpoint()?);
                peers.set_active(&pc.id(), tracked.is_active());
            }
            resources.peers.insert(tracked.key(), tracked);
        }

        info!(
            "[daemon] {}: {} repositories, {} chroots ({} hosted), {} sources, {} peers",
            config.daemon.identity,
            resources.repositories.len(),
            resources.chroots.len(),
            pool.hosted().len(),
            resources.sources.len(),
            resources.peers.len()
        );

        Ok(Self {
            config,
            store,
            pool,
            peers,
            builder: services.builder,
            remote: services.remote,
            coordinator,
            promotion: PromotionEngine::new(),
            repositories,
            resources: tokio::sync::Mutex::new(resources),
            inbound: DashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn pool(&self) -> &ChrootPool {
        &self.pool
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn repository(&self, dist: &DistributionString) -> Result<Arc<Repository>> {
        self.repositories
            .get(&dist.repository)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {}", dist.repository)))
    }

    // ---- managed resources ----

    /// Run one status operation and resynchronize hosting
    pub async fn status_op(&self, op: Operation, resource: &ResourceRef) -> Result<StatusRecord> {
        let mut resources = self.resources.lock().await;
        let missing = || Error::NotFound(resource.to_string());
        match resource.kind {
            ResourceKind::Chroot => {
                let tracked = resources.chroots.get_mut(&resource.key).ok_or_else(missing)?;
                let result = tracked.apply(op).await;
                let config = tracked.resource().config();
                let key = config.key();
                if tracked.is_active() {
                    self.pool.host(key, &config.name(), config.backend.kind());
                } else {
                    self.pool.unhost(&key);
                }
                self.finish_op(tracked, result)
            }
            ResourceKind::Repository => {
                let tracked = resources
                    .repositories
                    .get_mut(&resource.key)
                    .ok_or_else(missing)?;
                let result = tracked.apply(op).await;
                self.finish_op(tracked, result)
            }
            ResourceKind::Source => {
                let tracked = resources.sources.get_mut(&resource.key).ok_or_else(missing)?;
                let result = tracked.apply(op).await;
                self.finish_op(tracked, result)
            }
            ResourceKind::RemotePeer => {
                let tracked = resources.peers.get_mut(&resource.key).ok_or_else(missing)?;
                let result = tracked.apply(op).await;
                if tracked.record().status != Status::Removed {
                    self.peers.set_active(&tracked.resource().id(), tracked.is_active());
                }
                self.finish_op(tracked, result)
            }
        }
    }

    fn finish_op<R: ManagedResource>(
        &self,
        tracked: &Tracked<R>,
        result: Result<()>,
    ) -> Result<StatusRecord> {
        self.store.with(|conn| tracked.persist(conn))?;
        result?;
        Ok(tracked.record().clone())
    }

    /// Every managed resource with its status, chroots first
    pub async fn resources(&self) -> Vec<ResourceListing> {
        let now = Utc::now();
        let days = self.config.status.recheck_days;
        let resources = self.resources.lock().await;
        let mut listing = Vec::new();
        listing.extend(resources.chroots.values().map(|t| list_entry(t, now, days)));
        listing.extend(resources.repositories.values().map(|t| list_entry(t, now, days)));
        listing.extend(resources.sources.values().map(|t| list_entry(t, now, days)));
        listing.extend(resources.peers.values().map(|t| list_entry(t, now, days)));
        listing
    }

    /// Check every Prepared resource whose last check is older than the
    /// recheck interval; returns what was checked and whether it passed
    pub async fn recheck_due(&self, now: DateTime<Utc>) -> Vec<(ResourceRef, bool)> {
        let days = self.config.status.recheck_days;
        let due: Vec<ResourceRef> = self
            .resources()
            .await
            .into_iter()
            .filter(|l| l.record.needs_recheck(now, days))
            .map(|l| ResourceRef::new(l.kind, &l.key))
            .collect();

        let mut checked = Vec::with_capacity(due.len());
        for resource in due {
            match self.status_op(Operation::Check, &resource).await {
                Ok(record) => {
                    let passed = record.last_error.is_none();
                    debug!("[daemon] rechecked {}: {}", resource, record.describe());
                    checked.push((resource, passed));
                }
                Err(e) => {
                    warn!("[daemon] recheck of {} failed: {}", resource, e);
                    checked.push((resource, false));
                }
            }
        }
        checked
    }

    async fn repository_active(&self, identity: &str) -> bool {
        self.resources
            .lock()
            .await
            .repositories
            .get(identity)
            .is_some_and(|t| t.is_active())
    }

    // ---- package pipeline ----

    /// Run a new submission through the whole pipeline
    pub async fn submit(&self, submission: Submission) -> Result<PackageReport> {
        let payload = serde_json::to_string(&submission)?;
        let mut row = SubmissionRow::new(
            submission.package.clone(),
            submission.version.clone(),
            submission.distribution.to_string(),
            submission.component.clone(),
            submission.architectures.clone(),
            payload,
        );
        let id = self.store.with(|conn| row.insert(conn))?;
        info!("[daemon] received {} as submission {}", submission, id);
        self.process(id, submission, false).await
    }

    /// Drop a submission into the incoming spool of an instance
    ///
    /// Works without the instance lock; a running daemon picks the file up
    /// with [`take_incoming`](Self::take_incoming).
    pub fn enqueue(spool_dir: &Path, submission: &Submission) -> Result<PathBuf> {
        let incoming = spool_dir.join(INCOMING);
        std::fs::create_dir_all(&incoming)?;
        let mut file = tempfile::NamedTempFile::new_in(&incoming)?;
        serde_json::to_writer(&mut file, submission)?;
        let target = incoming.join(format!("{}-{}.json", submission.key(), uuid::Uuid::new_v4()));
        file.persist(&target)
            .map_err(|e| Error::IoError(format!("cannot spool {}: {}", target.display(), e)))?;
        info!("[daemon] spooled {} as {}", submission, target.display());
        Ok(target)
    }

    /// Claim every spooled submission, oldest first
    ///
    /// Unreadable files are renamed to `*.bad` and skipped.
    pub fn take_incoming(&self) -> Vec<Submission> {
        let incoming = self.config.daemon.spool_dir().join(INCOMING);
        let Ok(entries) = std::fs::read_dir(&incoming) else {
            return Vec::new();
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .map(|p| {
                let modified = std::fs::metadata(&p)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                (modified, p)
            })
            .collect();
        files.sort();

        let mut submissions = Vec::with_capacity(files.len());
        for (_, path) in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| self.parse_upload(&text));
            match parsed {
                Ok(submission) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("[daemon] cannot claim {}: {}", path.display(), e);
                        continue;
                    }
                    submissions.push(submission);
                }
                Err(e) => {
                    warn!("[daemon] unreadable spool file {}: {}", path.display(), e);
                    let _ = std::fs::rename(&path, path.with_extension("bad"));
                }
            }
        }
        submissions
    }

    /// Parse a spooled submission whose distribution may be a
    /// meta-distribution alias
    fn parse_upload(&self, text: &str) -> Result<Submission> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(name) = value.get("distribution").and_then(|d| d.as_str()) {
            let resolved = self.config.resolve_distribution(name)?;
            value["distribution"] = serde_json::Value::String(resolved.to_string());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Pick up every submission a previous run left unfinished
    ///
    /// Jobs that already reached a terminal state are not dispatched again.
    pub async fn recover(&self) -> Result<Vec<PackageReport>> {
        let rows = self.store.with(SubmissionRow::list_unfinished)?;
        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(id) = row.id else { continue };
            let submission: Submission = match serde_json::from_str(&row.payload) {
                Ok(submission) => submission,
                Err(e) => {
                    warn!("[daemon] submission {} has an unreadable payload: {}", id, e);
                    self.set_status(id, PackageStatus::Rejected, None, Some("unreadable payload"))?;
                    continue;
                }
            };
            info!("[daemon] recovering {} ({})", submission, row.status);
            reports.push(self.process(id, submission, true).await?);
        }
        Ok(reports)
    }

    /// Cancel a submission that is building; false if it is not
    pub fn cancel(&self, submission_id: i64) -> bool {
        self.coordinator.cancel(submission_id)
    }

    /// Cancel whichever submission of `<package>_<version>` is building
    pub fn cancel_key(&self, key: &str) -> Result<Option<i64>> {
        let (package, version) = split_key(key)?;
        for id in self.coordinator.running() {
            let row = self.store.with(|conn| SubmissionRow::find_by_id(conn, id))?;
            if row.is_some_and(|r| r.package == package && r.version == version)
                && self.coordinator.cancel(id)
            {
                return Ok(Some(id));
            }
        }
        debug!("[daemon] {} is not building, nothing to cancel", key);
        Ok(None)
    }

    /// Leave a cancellation request for a running daemon
    pub fn request_cancel(spool_dir: &Path, key: &str) -> Result<PathBuf> {
        split_key(key)?;
        let dir = spool_dir.join(CANCEL);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(key);
        std::fs::write(&target, b"")?;
        info!("[daemon] cancellation of {} requested", key);
        Ok(target)
    }

    /// Claim every spooled cancellation request
    pub fn take_cancel_requests(&self) -> Vec<String> {
        let dir = self.config.daemon.spool_dir().join(CANCEL);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            let Some(key) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            match std::fs::remove_file(&path) {
                Ok(()) => keys.push(key),
                Err(e) => warn!("[daemon] cannot claim {}: {}", path.display(), e),
            }
        }
        keys.sort();
        keys
    }

    async fn process(&self, id: i64, submission: Submission, resume: bool) -> Result<PackageReport> {
        let mut report = PackageReport::new(
            Some(id),
            &submission.package,
            &submission.version,
            &submission.distribution.to_string(),
        );

        let (repo, specs) = match self.precheck(&submission, resume).await {
            Ok(checked) => checked,
            Err(e) => {
                let reason = e.to_string();
                warn!("[daemon] rejected {}: {}", submission, reason);
                self.set_status(id, PackageStatus::Rejected, None, Some(&reason))?;
                return Ok(report.rejected(reason));
            }
        };

        self.set_status(id, PackageStatus::Building, None, None)?;
        let outcome = if resume {
            self.coordinator.resume(id, &submission, specs).await?
        } else {
            self.coordinator.run(id, &submission, specs).await?
        };
        report.outcome = Some(outcome.state);

        if !outcome.is_installable() {
            let reason = format!("build {}", outcome.state);
            warn!("[daemon] {}: {}", submission, reason);
            self.set_status(id, PackageStatus::Failed, Some(outcome.state), Some(&reason))?;
            report.status = PackageStatus::Failed;
            report.reason = Some(reason);
            report.failure = Some(outcome.failure_report(&submission));
            return Ok(report);
        }

        self.set_status(id, PackageStatus::Installing, Some(outcome.state), None)?;
        match self.install(&repo, &submission, &outcome).await {
            Ok(entry) => report.installed = Some(entry),
            Err(e) => {
                let reason = format!("install failed: {}", e);
                warn!("[daemon] {}: {}", submission, reason);
                self.set_status(id, PackageStatus::Failed, None, Some(&reason))?;
                report.status = PackageStatus::Failed;
                report.reason = Some(reason);
                return Ok(report);
            }
        }
        self.set_status(id, PackageStatus::Installed, None, None)?;
        report.status = PackageStatus::Installed;

        for target in submission.options.auto_ports() {
            let ported = match target.parse::<DistributionString>() {
                Ok(to) => self.port_one(&submission, to).await,
                Err(e) => PackageReport::new(None, &submission.package, &submission.version, &target)
                    .rejected(e.to_string()),
            };
            if ported.status != PackageStatus::Installed {
                warn!(
                    "[daemon] auto-port of {} to {} ended {}",
                    submission, ported.distribution, ported.status
                );
            }
            report.ports.push(ported);
        }
        Ok(report)
    }

    async fn precheck(
        &self,
        submission: &Submission,
        resume: bool,
    ) -> Result<(Arc<Repository>, Vec<JobSpec>)> {
        let dist = &submission.distribution;
        if dist.is_rollback() {
            return Err(Error::Rejected(format!("cannot upload to rollback distribution {}", dist)));
        }
        let repo = self
            .repositories
            .get(&dist.repository)
            .cloned()
            .ok_or_else(|| Error::Rejected(format!("unknown repository {}", dist.repository)))?;
        if !self.repository_active(&dist.repository).await {
            return Err(Error::Rejected(format!("repository {} is not active", dist.repository)));
        }

        let (distribution, suite) = repo.resolve(dist)?;
        if !suite.uploadable {
            return Err(Error::Rejected(format!("suite {} takes no uploads", suite.name)));
        }
        repo.check_version(dist, &submission.version)?;

        for target in submission.options.auto_ports() {
            target.parse::<DistributionString>().map_err(|e| {
                Error::Rejected(format!("bad auto-ports target {}: {}", target, e))
            })?;
        }

        if let Some(active) = repo.find_active(&submission.package, dist)? {
            match compare_versions(&submission.version, &active.version) {
                Ordering::Greater => {}
                Ordering::Equal if resume => {}
                _ => {
                    return Err(Error::Rejected(format!(
                        "{} is not newer than {} in {}",
                        submission.version, active.version, dist
                    )));
                }
            }
        }

        let specs = plan_jobs(submission, distribution, suite.experimental);
        if specs.is_empty() {
            return Err(Error::Rejected(format!(
                "none of {} is built for {}",
                submission.architectures.join(" "),
                distribution.codename
            )));
        }
        Ok((repo, specs))
    }

    async fn install(
        &self,
        repo: &Repository,
        submission: &Submission,
        outcome: &BuildOutcome,
    ) -> Result<RepositoryEntry> {
        // after a restart the install may already have happened
        if let Some(active) = repo.find_active(&submission.package, &submission.distribution)?
            && active.version == submission.version
        {
            return Ok(active);
        }
        repo.install(
            &submission.package,
            &submission.version,
            &submission.distribution,
            &submission.component,
            &outcome.artifacts(),
        )
        .await
    }

    /// Rebuild `source` for `to` under the port version the layout demands
    fn port_one<'a>(
        &'a self,
        source: &'a Submission,
        to: DistributionString,
    ) -> Pin<Box<dyn Future<Output = PackageReport> + Send + 'a>> {
        Box::pin(async move {
            let unrecorded = |reason: String| {
                PackageReport::new(None, &source.package, &source.version, &to.to_string())
                    .rejected(reason)
            };
            let repo = match self.repository(&to) {
                Ok(repo) => repo,
                Err(e) => return unrecorded(e.to_string()),
            };
            let version = match self.promotion.port_version(
                &repo,
                &source.version,
                &source.distribution,
                &to,
                Utc::now(),
            ) {
                Ok(version) => version,
                Err(e) => return unrecorded(e.to_string()),
            };

            let mut ported = source.clone();
            ported.version = version;
            ported.distribution = to.clone();
            ported.options = UploadOptions::default();
            info!(
                "[daemon] porting {} {} to {} as {}",
                source.package, source.version, to, ported.version
            );
            match self.submit(ported).await {
                Ok(report) => report,
                Err(e) => unrecorded(e.to_string()),
            }
        })
    }

    fn set_status(
        &self,
        id: i64,
        status: PackageStatus,
        outcome: Option<OutcomeState>,
        reason: Option<&str>,
    ) -> Result<()> {
        let outcome = outcome.map(|o| o.to_string());
        self.store.with(|conn| {
            SubmissionRow::update_status(
                conn,
                id,
                &status.to_string(),
                outcome.as_deref(),
                reason,
                status.is_final(),
            )
        })
    }

    /// Submissions, newest first
    pub fn history(&self, limit: i64) -> Result<Vec<SubmissionRow>> {
        self.store.with(|conn| SubmissionRow::list_recent(conn, limit))
    }

    /// The stored report of the latest submission of a package version
    pub fn report(&self, package: &str, version: &str) -> Result<PackageReport> {
        let row = self
            .store
            .with(|conn| SubmissionRow::find_by_package(conn, package, version))?
            .ok_or_else(|| Error::NotFound(format!("submission {} {}", package, version)))?;
        let id = row
            .id
            .ok_or_else(|| Error::NotFound(format!("submission {} {}", package, version)))?;
        let status: PackageStatus = row
            .status
            .parse()
            .map_err(|_| Error::ParseError(format!("package status {}", row.status)))?;
        let outcome: Option<OutcomeState> = row.outcome.as_deref().and_then(|o| o.parse().ok());

        let jobs: Vec<BuildJob> = self
            .store
            .with(|conn| BuildJobRow::list_for_submission(conn, id))?
            .iter()
            .map(|r| BuildJob::restore(JobSpec::new(&r.architecture), r))
            .collect();

        let mut report = PackageReport::new(Some(id), &row.package, &row.version, &row.distribution);
        report.status = status;
        report.outcome = outcome;
        report.reason = row.reason.clone();
        if status == PackageStatus::Failed && !jobs.is_empty() {
            let submission: Submission = serde_json::from_str(&row.payload)?;
            let outcome = BuildOutcome {
                state: outcome.unwrap_or(OutcomeState::AllFailed),
                jobs,
            };
            report.failure = Some(outcome.failure_report(&submission));
        }
        Ok(report)
    }

    // ---- operator commands ----

    pub async fn execute(&self, command: Command, confirm: Option<&str>) -> Result<CommandOutput> {
        command.confirm(confirm)?;
        info!("[daemon] {}", command);
        match command {
            Command::Status { op, resource } => {
                let record = self.status_op(op, &resource).await?;
                Ok(CommandOutput::Status { resource, record })
            }
            Command::Migrate {
                package,
                distribution,
            } => {
                let repo = self.repository(&distribution)?;
                let outcome = self
                    .promotion
                    .migrate(&repo, &package, &distribution, confirm)
                    .await?;
                Ok(CommandOutput::Migrated { outcome })
            }
            Command::RemovePackage {
                package,
                distribution,
            } => {
                let repo = self.repository(&distribution)?;
                let entry = repo.remove(&package, &distribution).await?;
                if entry.is_none() {
                    debug!("[daemon] {} not in {}, nothing to remove", package, distribution);
                }
                Ok(CommandOutput::Removed { entry })
            }
            Command::Port { package, from, to } => {
                let repo = self.repository(&from)?;
                let active = repo
                    .find_active(&package, &from)?
                    .ok_or_else(|| Error::NotFound(format!("{} in {}", package, from)))?;
                let stored = self
                    .store
                    .with(|conn| SubmissionRow::find_by_package(conn, &package, &active.version))?
                    .ok_or_else(|| {
                        Error::NotFound(format!("source of {} {}", package, active.version))
                    })?;
                let mut source: Submission = serde_json::from_str(&stored.payload)?;
                source.distribution = from.clone();

                let mut reports = Vec::with_capacity(to.len());
                for target in to {
                    reports.push(self.port_one(&source, target).await);
                }
                Ok(CommandOutput::Ported { reports })
            }
            Command::AutoMigrate => Ok(CommandOutput::AutoMigrated {
                outcomes: self.auto_migrate(Utc::now()).await?,
            }),
            Command::Cancel { key } => {
                let submission = self.cancel_key(&key)?;
                Ok(CommandOutput::Cancelled { key, submission })
            }
            Command::Show { package } => Ok(CommandOutput::Shown {
                distributions: self.show(&package)?,
                package,
            }),
            Command::Retry { key } => Ok(CommandOutput::Retried {
                report: self.retry(&key).await?,
            }),
        }
    }

    /// Where `package` is installed, over every repository
    pub fn show(&self, package: &str) -> Result<Vec<PackageRing>> {
        let mut views = Vec::new();
        for repo in self.repositories.values() {
            for (dist, ring) in repo.package_rings(package)? {
                views.push(PackageRing {
                    distribution: dist.to_string(),
                    active: ring.active().cloned(),
                    rollbacks: ring.rollbacks().cloned().collect(),
                });
            }
        }
        Ok(views)
    }

    /// Run the stored payload of a failed or rejected submission again
    pub async fn retry(&self, key: &str) -> Result<PackageReport> {
        let (package, version) = split_key(key)?;
        let row = self
            .store
            .with(|conn| SubmissionRow::find_by_package(conn, package, version))?
            .ok_or_else(|| Error::NotFound(format!("submission {}", key)))?;
        match row.status.parse::<PackageStatus>() {
            Ok(PackageStatus::Failed | PackageStatus::Rejected) => {}
            _ => {
                return Err(Error::Rejected(format!(
                    "{} is {}; only failed or rejected submissions are retried",
                    key, row.status
                )));
            }
        }
        let submission: Submission = serde_json::from_str(&row.payload)?;
        info!("[daemon] retrying {} (was submission {:?})", submission, row.id);
        self.submit(submission).await
    }

    /// Automatic migrations over every Active repository
    pub async fn auto_migrate(&self, now: DateTime<Utc>) -> Result<Vec<MigrationOutcome>> {
        let mut outcomes = Vec::new();
        for (identity, repo) in &self.repositories {
            if self.repository_active(identity).await {
                outcomes.extend(self.promotion.auto_migrate(repo, now).await?);
            }
        }
        Ok(outcomes)
    }

    /// Fetch fresh advertisements from every active peer
    pub async fn refresh_peers(&self) {
        let endpoints = {
            let resources = self.resources.lock().await;
            resources
                .peers
                .values()
                .filter(|t| t.is_active())
                .map(|t| t.resource().config().endpoint())
                .collect::<Vec<_>>()
        };
        for endpoint in endpoints {
            let endpoint = match endpoint {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("[daemon] bad peer endpoint: {}", e);
                    continue;
                }
            };
            match self.remote.advertisement(&endpoint).await {
                Ok(advertisement) => {
                    self.peers.advertise(&endpoint.id, advertisement);
                    self.peers.record_success(&endpoint.id);
                }
                Err(e) => {
                    debug!("[daemon] peer {} unreachable: {}", endpoint.url, e);
                    self.peers.record_failure(&endpoint.id);
                }
            }
        }
    }

    /// Periodic housekeeping: expired leases, peer advertisements, due
    /// rechecks, auto-migration
    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<()> {
        self.refresh_peers().await;
        let reaped = self.pool.reap_expired(now);
        if reaped > 0 {
            warn!("[daemon] reaped {} expired chroot session(s)", reaped);
        }
        self.recheck_due(now).await;
        let migrated = self.auto_migrate(now).await?;
        if !migrated.is_empty() {
            info!("[daemon] {} automatic migration(s)", migrated.len());
        }
        Ok(())
    }

    // ---- serving peers ----

    /// What this instance offers to its peers
    pub fn advertisement(&self) -> Advertisement {
        let chroots = self.pool.hosted();
        let max_capacity = self.pool.max_sessions() * chroots.len();
        let free_capacity = self.pool.free_capacity();
        let load = if max_capacity == 0 {
            1.0
        } else {
            1.0 - free_capacity as f64 / max_capacity as f64
        };
        Advertisement {
            identity: self.config.daemon.identity.clone(),
            active: !chroots.is_empty(),
            chroots,
            free_capacity,
            max_capacity,
            load,
        }
    }

    /// Build one job for a peer in a local session
    ///
    /// Never waits for a slot: a busy chroot answers `NoCapacity` so the
    /// requester can go elsewhere. The job timeout bounds the build.
    pub async fn serve_build(&self, request: BuildRequest) -> BuildResult {
        let key = ChrootKey::new(
            &request.submission.distribution.codename,
            &request.job.architecture,
        );
        if !request
            .request_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
            || request.request_id.is_empty()
        {
            return BuildResult::new(ResultKind::Refused, "malformed request id");
        }
        if !self.pool.is_hosted(&key.codename, &key.architecture) {
            return BuildResult::new(ResultKind::Refused, format!("{} is not hosted here", key));
        }
        if self.pool.available(&key) == 0 {
            return BuildResult::new(ResultKind::NoCapacity, format!("{} is busy", key));
        }

        let spool = self
            .config
            .daemon
            .spool_dir()
            .join("peers")
            .join(&request.request_id);
        let dsc_name = request.submission.dsc.file_name().map(PathBuf::from);
        let Some(dsc_name) = dsc_name else {
            return BuildResult::new(ResultKind::Refused, "request names no .dsc");
        };
        for file in &request.sources {
            if let Err(e) = file.write_into(&spool) {
                let _ = std::fs::remove_dir_all(&spool);
                return BuildResult::new(ResultKind::Refused, e.to_string());
            }
        }
        let mut submission = request.submission.clone();
        submission.dsc = spool.join(dsc_name);

        let token = CancellationToken::new();
        self.inbound.insert(request.request_id.clone(), token.clone());
        let owner = format!("peer:{}:{}", request.origin, request.request_id);
        info!(
            "[daemon] building {} ({}) for {}",
            submission, key.architecture, request.origin
        );

        let result = tokio::select! {
            _ = token.cancelled() => BuildResult::new(ResultKind::Failed, "cancelled by requester"),
            built = tokio::time::timeout(
                self.config.build.job_timeout(),
                self.build_in_session(&submission, &request.job, &owner),
            ) => built.unwrap_or_else(|_| {
                warn!(
                    "[daemon] {} ({}) for {} timed out",
                    submission, key.architecture, request.origin
                );
                BuildResult::new(
                    ResultKind::TimedOut,
                    format!(
                        "timed out on {} after {}s",
                        self.config.daemon.identity, self.config.build.job_timeout_secs
                    ),
                )
            }),
        };

        self.pool.release_owned_by(&owner);
        self.inbound.remove(&request.request_id);
        if let Err(e) = std::fs::remove_dir_all(&spool) {
            debug!("[daemon] cannot clean {}: {}", spool.display(), e);
        }
        result
    }

    async fn build_in_session(&self, submission: &Submission, job: &JobSpec, owner: &str) -> BuildResult {
        let session = match self
            .pool
            .acquire(
                &submission.distribution.codename,
                &job.architecture,
                self.config.pool.acquire_timeout(),
                owner,
            )
            .await
        {
            Ok(session) => session,
            Err(e @ (Error::Capacity(_) | Error::Timeout(_))) => {
                return BuildResult::new(ResultKind::NoCapacity, e.to_string());
            }
            Err(e) => return BuildResult::new(ResultKind::StartFailure, e.to_string()),
        };
        let result = self.builder.build(submission, job, &session).await;
        self.pool.release(&session);
        result
    }

    /// Stop a build served for a peer; false if it is not running
    pub fn cancel_inbound(&self, request_id: &str) -> bool {
        match self.inbound.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

fn list_entry<R: ManagedResource>(tracked: &Tracked<R>, now: DateTime<Utc>, days: i64) -> ResourceListing {
    let record = tracked.record().clone();
    ResourceListing {
        kind: tracked.resource().kind(),
        key: tracked.key(),
        needs_recheck: record.needs_recheck(now, days),
        record,
    }
}
