// src/repository/mod.rs

//! Versioned package store for one repository identity
//!
//! Every (package, distribution) pair owns a [`RollbackRing`]. Rings are
//! mutated only under their own async lock, read into memory, changed, and
//! written back in one transaction guarded by a generation counter, so a
//! failed install, migration or removal never leaves a half-written ring.
//! Artifacts live in a pool shared by all distributions of the repository
//! and are deleted once no ring slot references them.

pub mod distribution;
pub mod layout;
pub mod promotion;
pub mod ring;
pub mod version;

pub use distribution::{Distribution, DistributionString, LintianMode};
pub use layout::{Layout, Suite, check_meta_ambiguity, resolve_distribution};
pub use promotion::{MigrationOutcome, PromotionEngine};
pub use ring::{RepositoryEntry, RollbackRing};
pub use version::DebianVersion;

use crate::db::Store;
use crate::db::models::{EntryRow, RingKey};
use crate::error::{Error, Result};
use crate::status::{ManagedResource, ResourceKind, fingerprint};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Repository section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub identity: String,

    #[serde(default = "default_layout_name")]
    pub layout: String,

    /// Codenames served by this repository
    pub distributions: Vec<String>,
}

fn default_layout_name() -> String {
    "Default".to_string()
}

pub struct Repository {
    identity: String,
    layout: Arc<Layout>,
    distributions: Vec<Distribution>,
    store: Arc<Store>,
    pool_dir: PathBuf,
    ring_locks: DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("identity", &self.identity)
            .field("layout", &self.layout.name)
            .field("pool_dir", &self.pool_dir)
            .finish_non_exhaustive()
    }
}

impl Repository {
    pub fn new(
        identity: &str,
        layout: Arc<Layout>,
        distributions: Vec<Distribution>,
        store: Arc<Store>,
        base_dir: &Path,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            layout,
            distributions,
            store,
            pool_dir: base_dir.join("repositories").join(identity).join("pool"),
            ring_locks: DashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn distributions(&self) -> &[Distribution] {
        &self.distributions
    }

    pub fn pool_dir(&self) -> &Path {
        &self.pool_dir
    }

    pub fn distribution(&self, codename: &str) -> Option<&Distribution> {
        self.distributions.iter().find(|d| d.codename == codename)
    }

    /// Every `<codename>-<identity>-<suite>` this repository serves
    pub fn distribution_strings(&self) -> Vec<DistributionString> {
        self.distributions
            .iter()
            .flat_map(|d| {
                self.layout
                    .suites
                    .iter()
                    .map(move |s| DistributionString::new(&d.codename, &self.identity, &s.name))
            })
            .collect()
    }

    /// Look up the codename policy and suite a distribution string names
    pub fn resolve(&self, dist: &DistributionString) -> Result<(&Distribution, &Suite)> {
        if dist.repository != self.identity {
            return Err(Error::NotFound(format!(
                "distribution {} does not belong to repository {}",
                dist, self.identity
            )));
        }
        let distribution = self.distribution(&dist.codename).ok_or_else(|| {
            Error::NotFound(format!(
                "codename {} in repository {}",
                dist.codename, self.identity
            ))
        })?;
        let suite = self.layout.require_suite(&dist.suite)?;
        if let Some(slot) = dist.rollback
            && slot as usize >= suite.rollback
        {
            return Err(Error::NotFound(format!(
                "{}: suite {} keeps only {} rollbacks",
                dist, suite.name, suite.rollback
            )));
        }
        Ok((distribution, suite))
    }

    /// Reject a version that the suite's restriction does not accept
    pub fn check_version(&self, dist: &DistributionString, version: &str) -> Result<()> {
        let (distribution, suite) = self.resolve(dist)?;
        let restriction =
            self.layout
                .version_restriction(suite, &self.identity, &distribution.base_version)?;
        if restriction.is_match(version) {
            Ok(())
        } else {
            Err(Error::VersionRestriction(format!(
                "version {} does not match {} required by {}",
                version,
                restriction.as_str(),
                dist.base()
            )))
        }
    }

    fn ring_lock(&self, package: &str, dist: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.ring_locks
            .entry((package.to_string(), dist.to_string()))
            .or_default()
            .clone()
    }

    fn ring_key(&self, package: &str, dist: &str) -> RingKey {
        RingKey::new(&self.identity, package, dist)
    }

    /// Snapshot of one ring
    pub fn ring(&self, package: &str, dist: &DistributionString) -> Result<RollbackRing> {
        let (_, suite) = self.resolve(&dist.base())?;
        let key = self.ring_key(package, &dist.base().to_string());
        let rows = self.store.with(|conn| EntryRow::load_ring(conn, &key))?;
        RollbackRing::from_rows(suite.rollback, &rows)
    }

    pub fn find_active(&self, package: &str, dist: &DistributionString) -> Result<Option<RepositoryEntry>> {
        Ok(self.ring(package, dist)?.active().cloned())
    }

    /// Every non-empty ring of `package`, by codename then suite order
    pub fn package_rings(&self, package: &str) -> Result<Vec<(DistributionString, RollbackRing)>> {
        let mut rings = Vec::new();
        for distribution in &self.distributions {
            for suite in &self.layout.suites {
                let dist = DistributionString::new(&distribution.codename, &self.identity, &suite.name);
                let ring = self.ring(package, &dist)?;
                if !ring.is_empty() {
                    rings.push((dist, ring));
                }
            }
        }
        Ok(rings)
    }

    /// Active entries of one distribution
    pub fn list_active(&self, dist: &DistributionString) -> Result<Vec<RepositoryEntry>> {
        let rows = self
            .store
            .with(|conn| EntryRow::list_active(conn, &self.identity, &dist.base().to_string()))?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(active) = RollbackRing::from_rows(0, std::slice::from_ref(row))?.active() {
                entries.push(active.clone());
            }
        }
        Ok(entries)
    }

    /// Read, mutate and write back one ring; the caller holds its lock
    fn update_ring<F, T>(&self, package: &str, dist: &str, depth: usize, f: F) -> Result<(T, Vec<RepositoryEntry>)>
    where
        F: FnOnce(&mut RollbackRing) -> Result<(T, Vec<RepositoryEntry>)>,
    {
        let key = self.ring_key(package, dist);
        let (generation, rows) = self.store.with(|conn| {
            Ok((EntryRow::generation(conn, &key)?, EntryRow::load_ring(conn, &key)?))
        })?;
        let mut ring = RollbackRing::from_rows(depth, &rows)?;

        let (value, discarded) = f(&mut ring)?;

        let new_rows = ring.to_rows(&self.identity);
        self.store
            .transaction(|tx| EntryRow::replace_ring(tx, &key, generation, &new_rows))?;
        Ok((value, discarded))
    }

    fn store_artifacts(
        &self,
        package: &str,
        version: &str,
        component: &str,
        artifacts: &[PathBuf],
    ) -> Result<Vec<String>> {
        let relative_dir = PathBuf::from(component).join(package).join(version);
        let target_dir = self.pool_dir.join(&relative_dir);
        std::fs::create_dir_all(&target_dir)?;

        let mut stored = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let name = artifact.file_name().ok_or_else(|| {
                Error::IoError(format!("artifact without file name: {}", artifact.display()))
            })?;
            let target = target_dir.join(name);
            if *artifact != target {
                std::fs::copy(artifact, &target).map_err(|e| {
                    Error::IoError(format!("copy {} into pool: {}", artifact.display(), e))
                })?;
            }
            stored.push(relative_dir.join(name).to_string_lossy().into_owned());
        }
        Ok(stored)
    }

    /// Delete pool files no ring slot references any more
    fn prune(&self, paths: impl IntoIterator<Item = String>) {
        for path in paths {
            let referenced = self
                .store
                .with(|conn| EntryRow::artifact_references(conn, &path))
                .unwrap_or(1);
            if referenced > 0 {
                continue;
            }
            let full = self.pool_dir.join(&path);
            match std::fs::remove_file(&full) {
                Ok(()) => debug!("[repository] pruned {}", full.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("[repository] cannot prune {}: {}", full.display(), e),
            }
            if let Some(dir) = full.parent() {
                // only succeeds once the version directory is empty
                let _ = std::fs::remove_dir(dir);
            }
        }
    }

    fn prune_entries(&self, discarded: Vec<RepositoryEntry>) {
        for entry in &discarded {
            info!(
                "[repository] {}: {} {} dropped from rollback history",
                entry.distribution, entry.package, entry.version
            );
        }
        self.prune(discarded.into_iter().flat_map(|e| e.artifacts));
    }

    /// Install a built package as the active entry of a distribution
    pub async fn install(
        &self,
        package: &str,
        version: &str,
        dist: &DistributionString,
        component: &str,
        artifacts: &[PathBuf],
    ) -> Result<RepositoryEntry> {
        if dist.is_rollback() {
            return Err(Error::Rejected(format!("cannot install into rollback distribution {}", dist)));
        }
        let (distribution, suite) = self.resolve(dist)?;
        if !distribution.components.iter().any(|c| c == component) {
            return Err(Error::Rejected(format!(
                "component {} not served by {}",
                component, dist
            )));
        }
        let depth = suite.rollback;
        let dist_name = dist.to_string();

        let lock = self.ring_lock(package, &dist_name);
        let _guard = lock.lock().await;

        let stored = self.store_artifacts(package, version, component, artifacts)?;
        let mut entry = RepositoryEntry::new(package, version, &dist_name, component);
        entry.artifacts = stored.clone();

        let installed = entry.clone();
        match self.update_ring(package, &dist_name, depth, move |ring| Ok(((), ring.install_newer(entry)?))) {
            Ok(((), discarded)) => {
                info!("[repository] {}: installed {} {}", dist_name, package, version);
                self.prune_entries(discarded);
                Ok(installed)
            }
            Err(e) => {
                self.prune(stored);
                Err(e)
            }
        }
    }

    /// Copy the active entry of `from` into `to`, shifting `to`'s ring
    ///
    /// Both rings are locked while the candidate is read, checked against
    /// `to`'s version restriction and compared with `to`'s active entry.
    pub async fn copy_active(
        &self,
        package: &str,
        from: &DistributionString,
        to: &DistributionString,
    ) -> Result<MigrationOutcome> {
        if from.is_rollback() || to.is_rollback() {
            return Err(Error::Rejected(format!(
                "copy {} -> {}: rollback distributions are not copy targets",
                from, to
            )));
        }
        let (_, to_suite) = self.resolve(to)?;
        self.resolve(from)?;
        let depth = to_suite.rollback;
        let (from_name, to_name) = (from.to_string(), to.to_string());

        // lock both rings in name order
        let (first, second) = if from_name <= to_name {
            (self.ring_lock(package, &from_name), self.ring_lock(package, &to_name))
        } else {
            (self.ring_lock(package, &to_name), self.ring_lock(package, &from_name))
        };
        let _g1 = first.lock().await;
        let _g2 = second.lock().await;

        let source = self
            .find_active(package, from)?
            .ok_or_else(|| Error::NotFound(format!("{} in {}", package, from)))?;
        self.check_version(to, &source.version)?;

        if let Some(existing) = self.find_active(package, to)?
            && existing.version == source.version
        {
            info!("[repository] {} {} already in {}", package, existing.version, to_name);
            return Ok(MigrationOutcome::AlreadyPresent { entry: existing });
        }

        let mut entry = source;
        entry.distribution = to_name.clone();
        entry.installed_at = Utc::now();
        let copied = entry.clone();

        let ((), discarded) = self.update_ring(package, &to_name, depth, move |ring| {
            Ok(((), ring.install_newer(entry)?))
        })?;
        info!(
            "[repository] {} {}: {} -> {}",
            package, copied.version, from_name, to_name
        );
        self.prune_entries(discarded);
        Ok(MigrationOutcome::Migrated {
            entry: copied,
            from: from_name,
        })
    }

    /// Take a package out of a distribution
    ///
    /// From a plain distribution the active entry moves to rollback 0; from
    /// a `-rollbackN` distribution that rollback entry is dropped for good.
    /// Returns `None` when there was nothing to remove.
    pub async fn remove(&self, package: &str, dist: &DistributionString) -> Result<Option<RepositoryEntry>> {
        let (_, suite) = self.resolve(dist)?;
        let depth = suite.rollback;
        let base = dist.base().to_string();

        let lock = self.ring_lock(package, &base);
        let _guard = lock.lock().await;

        let (removed, discarded) = match dist.rollback {
            None => self.update_ring(package, &base, depth, |ring| Ok(ring.remove_active()))?,
            Some(slot) => self.update_ring(package, &base, depth, |ring| {
                let purged = ring.purge(slot as usize);
                Ok((purged.clone(), purged.into_iter().collect()))
            })?,
        };

        if let Some(entry) = &removed {
            info!("[repository] {}: removed {} {}", dist, package, entry.version);
        }
        if dist.rollback.is_some() {
            self.prune(discarded.into_iter().flat_map(|e| e.artifacts));
        } else {
            self.prune_entries(discarded);
        }
        Ok(removed)
    }

    /// Promote rollback `slot` of a distribution back to active
    pub async fn restore(&self, package: &str, dist: &DistributionString, slot: usize) -> Result<RepositoryEntry> {
        let base = dist.base();
        let (_, suite) = self.resolve(&base)?;
        let depth = suite.rollback;
        let base_name = base.to_string();

        let lock = self.ring_lock(package, &base_name);
        let _guard = lock.lock().await;

        let (restored, discarded) = self.update_ring(package, &base_name, depth, |ring| {
            let discarded = ring.restore(slot)?;
            let restored = ring
                .active()
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("{} rollback {}", base_name, slot)))?;
            Ok((restored, discarded))
        })?;
        info!(
            "[repository] {}: restored {} {} from rollback {}",
            base_name, package, restored.version, slot
        );
        self.prune_entries(discarded);
        Ok(restored)
    }
}

/// Layouts of all repositories currently prepared on this instance, by identity
pub type LayoutsInUse = Arc<RwLock<BTreeMap<String, Arc<Layout>>>>;

/// A repository as a managed resource
pub struct RepositoryResource {
    repository: Arc<Repository>,
    in_use: LayoutsInUse,
}

impl RepositoryResource {
    pub fn new(repository: Arc<Repository>, in_use: LayoutsInUse) -> Self {
        Self { repository, in_use }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }
}

#[async_trait]
impl ManagedResource for RepositoryResource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Repository
    }

    fn key(&self) -> String {
        self.repository.identity.clone()
    }

    fn fingerprint(&self) -> String {
        fingerprint(&(self.repository.layout(), self.repository.distributions()))
    }

    async fn prepare(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.repository.pool_dir)?;
        self.in_use.write().insert(
            self.repository.identity.clone(),
            self.repository.layout.clone(),
        );
        Ok(())
    }

    /// Layout and policy validation plus the meta-distribution ambiguity
    /// pass over every repository in use
    async fn check(&mut self) -> Result<()> {
        let repo = &self.repository;
        if !repo.pool_dir.is_dir() {
            return Err(Error::NotFound(format!("pool {}", repo.pool_dir.display())));
        }
        repo.layout.validate()?;
        for distribution in &repo.distributions {
            distribution.validate()?;
            for suite in &repo.layout.suites {
                repo.layout
                    .version_restriction(suite, &repo.identity, &distribution.base_version)?;
            }
        }

        let snapshot: Vec<(String, Arc<Layout>)> = {
            let mut in_use = self.in_use.read().clone();
            in_use.insert(repo.identity.clone(), repo.layout.clone());
            in_use.into_iter().collect()
        };
        let pairs: Vec<(&str, &Layout)> = snapshot
            .iter()
            .map(|(rid, layout)| (rid.as_str(), layout.as_ref()))
            .collect();
        check_meta_ambiguity(&pairs)
    }

    async fn remove(&mut self) -> Result<()> {
        self.in_use.write().remove(&self.repository.identity);
        match std::fs::remove_dir_all(&self.repository.pool_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
