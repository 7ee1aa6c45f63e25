// src/status/mod.rs

//! Lifecycle state machine shared by every long-lived managed resource
//!
//! Chroots, repositories, sources and remote peers all move through the
//! same states:
//!
//! ```text
//! Removed --prepare--> Prepared(+flag) --activate--> Active
//!    ^                      |   ^                      |
//!    +-------remove---------+   +------deactivate------+
//! ```
//!
//! Prepared carries one flag at a time: `Clear`, `Unchecked`, `Changed`,
//! `Failed` or `FailedReactivate`. Only a flag-free Prepared resource can
//! become Active directly. The resource-specific work (creating a chroot,
//! probing a peer) lives behind the [`ManagedResource`] trait; [`Tracked`]
//! owns the transitions.
//!
//! Callers serialize operations per resource: `Tracked` takes `&mut self`
//! for every transition.

use crate::db::models::ResourceStatusRow;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

/// Coarse lifecycle state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    Removed,
    Prepared,
    Active,
}

/// Orthogonal flag carried while Prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CheckFlag {
    /// Checked and healthy
    Clear,
    /// Prepared but never checked since
    Unchecked,
    /// Configuration edited; needs a re-prepare
    Changed,
    /// Last check failed
    Failed,
    /// Activation requested while unhealthy; activates on the next good check
    FailedReactivate,
}

/// Kind of managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceKind {
    Chroot,
    Repository,
    Source,
    RemotePeer,
}

/// Operator operations on a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Prepare,
    Check,
    Activate,
    Deactivate,
    Remove,
}

/// Persistable lifecycle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    pub flag: CheckFlag,
    pub last_checked: Option<DateTime<Utc>>,
    /// Message of the last failed check, kept for listings
    pub last_error: Option<String>,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            status: Status::Removed,
            flag: CheckFlag::Clear,
            last_checked: None,
            last_error: None,
        }
    }
}

impl StatusRecord {
    /// Whether `op` is a valid transition from this record
    pub fn permits(&self, op: Operation) -> bool {
        match (self.status, op) {
            (_, Operation::Remove) => true,
            (Status::Removed, Operation::Prepare) => true,
            (Status::Removed, _) => false,
            (Status::Active, Operation::Deactivate) => true,
            (Status::Active, _) => false,
            (Status::Prepared, Operation::Prepare) => self.flag == CheckFlag::Changed,
            (Status::Prepared, Operation::Check) => self.flag != CheckFlag::Changed,
            (Status::Prepared, Operation::Activate) => self.flag != CheckFlag::Changed,
            (Status::Prepared, Operation::Deactivate) => self.flag == CheckFlag::FailedReactivate,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    /// Whether a Prepared resource is due for another check
    pub fn needs_recheck(&self, now: DateTime<Utc>, interval_days: i64) -> bool {
        if self.status != Status::Prepared {
            return false;
        }
        match self.last_checked {
            None => true,
            Some(at) => now - at >= Duration::days(interval_days),
        }
    }

    /// Short display form used in listings, e.g. `prepared (failed)`
    pub fn describe(&self) -> String {
        match (self.status, self.flag) {
            (Status::Prepared, flag) => format!("prepared ({})", flag),
            (status, _) => status.to_string(),
        }
    }

    fn reject(&self, key: &str, op: Operation) -> Error {
        Error::InvalidTransition(format!(
            "{}: cannot {} while {}",
            key,
            op,
            self.describe()
        ))
    }
}

/// Hex SHA-256 over the JSON form of a resource configuration
pub fn fingerprint<T: Serialize + ?Sized>(config: &T) -> String {
    let json = serde_json::to_vec(config).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

/// Resource-specific capability behind the shared state machine
#[async_trait]
pub trait ManagedResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Stable key unique within the resource kind
    fn key(&self) -> String;

    /// Digest of the configuration behind the resource; empty when the
    /// resource has nothing configurable
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// Create the external resource
    async fn prepare(&mut self) -> Result<()>;

    /// Bring an already prepared resource in line with changed configuration
    async fn sync(&mut self) -> Result<()> {
        self.remove().await?;
        self.prepare().await
    }

    /// Verify external resource integrity
    async fn check(&mut self) -> Result<()>;

    /// Discard the external resource
    async fn remove(&mut self) -> Result<()>;

    /// Hook run when the resource becomes Active
    async fn activate_side_effects(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A managed resource together with its lifecycle record
#[derive(Debug)]
pub struct Tracked<R> {
    resource: R,
    record: StatusRecord,
}

impl<R: ManagedResource> Tracked<R> {
    /// Wrap a resource that does not exist on the system yet
    pub fn new(resource: R) -> Self {
        Self {
            resource,
            record: StatusRecord::default(),
        }
    }

    /// Wrap a resource with a previously persisted record
    pub fn with_record(resource: R, record: StatusRecord) -> Self {
        Self { resource, record }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    pub fn key(&self) -> String {
        self.resource.key()
    }

    pub fn is_active(&self) -> bool {
        self.record.is_active()
    }

    fn ensure(&self, op: Operation) -> Result<()> {
        if self.record.permits(op) {
            Ok(())
        } else {
            Err(self.record.reject(&self.resource.key(), op))
        }
    }

    /// Create (from Removed) or synchronize (from Prepared+Changed)
    pub async fn prepare(&mut self) -> Result<()> {
        self.ensure(Operation::Prepare)?;
        let key = self.resource.key();
        if self.record.status == Status::Removed {
            self.resource.prepare().await?;
            info!("[status] {} {}: prepared", self.resource.kind(), key);
        } else {
            self.resource.sync().await?;
            info!("[status] {} {}: synchronized", self.resource.kind(), key);
        }
        self.record.status = Status::Prepared;
        self.record.flag = CheckFlag::Unchecked;
        Ok(())
    }

    /// Run the integrity check
    ///
    /// A failing check is recorded in the flag and reported as `Ok(false)`;
    /// only an invalid transition is an error.
    pub async fn check(&mut self) -> Result<bool> {
        self.ensure(Operation::Check)?;
        let key = self.resource.key();
        self.record.last_checked = Some(Utc::now());

        match self.resource.check().await {
            Ok(()) => {
                self.record.last_error = None;
                if self.record.flag == CheckFlag::FailedReactivate {
                    self.resource.activate_side_effects().await?;
                    self.record.status = Status::Active;
                    info!("[status] {} {}: check passed, reactivated", self.resource.kind(), key);
                } else {
                    info!("[status] {} {}: check passed", self.resource.kind(), key);
                }
                self.record.flag = CheckFlag::Clear;
                Ok(true)
            }
            Err(e) => {
                warn!("[status] {} {}: check failed: {}", self.resource.kind(), key, e);
                self.record.last_error = Some(e.to_string());
                if self.record.flag != CheckFlag::FailedReactivate {
                    self.record.flag = CheckFlag::Failed;
                }
                Ok(false)
            }
        }
    }

    /// Activate a checked resource, or defer activation until the next good check
    pub async fn activate(&mut self) -> Result<()> {
        self.ensure(Operation::Activate)?;
        let key = self.resource.key();
        match self.record.flag {
            CheckFlag::Clear => {
                self.resource.activate_side_effects().await?;
                self.record.status = Status::Active;
                info!("[status] {} {}: activated", self.resource.kind(), key);
            }
            CheckFlag::Unchecked | CheckFlag::Failed => {
                self.record.flag = CheckFlag::FailedReactivate;
                info!(
                    "[status] {} {}: activation deferred until next successful check",
                    self.resource.kind(),
                    key
                );
            }
            CheckFlag::FailedReactivate | CheckFlag::Changed => {}
        }
        Ok(())
    }

    /// Leave Active, or cancel a pending reactivation
    pub async fn deactivate(&mut self) -> Result<()> {
        self.ensure(Operation::Deactivate)?;
        if self.record.status == Status::Active {
            self.record.status = Status::Prepared;
            self.record.flag = CheckFlag::Unchecked;
        } else {
            self.record.flag = CheckFlag::Failed;
        }
        info!("[status] {} {}: deactivated", self.resource.kind(), self.resource.key());
        Ok(())
    }

    /// Discard the external resource; removing a removed resource is a no-op
    pub async fn remove(&mut self) -> Result<()> {
        if self.record.status != Status::Removed {
            self.resource.remove().await?;
            info!("[status] {} {}: removed", self.resource.kind(), self.resource.key());
        }
        self.record = StatusRecord::default();
        Ok(())
    }

    /// Record a configuration edit
    ///
    /// Active resources drop back to Prepared; a re-prepare is needed before
    /// a check can clear the flag again.
    pub fn mark_changed(&mut self) {
        if self.record.status != Status::Removed {
            self.record.status = Status::Prepared;
            self.record.flag = CheckFlag::Changed;
        }
    }

    /// Run one operator operation by name
    pub async fn apply(&mut self, op: Operation) -> Result<()> {
        match op {
            Operation::Prepare => self.prepare().await,
            Operation::Check => self.check().await.map(|_| ()),
            Operation::Activate => self.activate().await,
            Operation::Deactivate => self.deactivate().await,
            Operation::Remove => self.remove().await,
        }
    }

    /// Persist the record under (kind, key)
    pub fn persist(&self, conn: &Connection) -> Result<()> {
        ResourceStatusRow::from_record(
            self.resource.kind(),
            &self.resource.key(),
            &self.record,
            &self.resource.fingerprint(),
        )
        .upsert(conn)
    }

    /// Wrap a resource with its persisted record, or a fresh one if none exists
    ///
    /// A record written under a different configuration comes back as
    /// Prepared + Changed.
    pub fn restore(resource: R, conn: &Connection) -> Result<Self> {
        let Some(row) = ResourceStatusRow::find(conn, resource.kind(), &resource.key())? else {
            return Ok(Self::new(resource));
        };
        let current = resource.fingerprint();
        let mut tracked = Self::with_record(resource, row.to_record()?);
        if let Some(stored) = &row.fingerprint
            && !current.is_empty()
            && *stored != current
            && tracked.record.status != Status::Removed
        {
            info!(
                "[status] {} {}: configuration changed since last run",
                tracked.resource.kind(),
                tracked.key()
            );
            tracked.mark_changed();
        }
        Ok(tracked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Toggle {
        healthy: Arc<AtomicBool>,
        prepares: Arc<AtomicUsize>,
        removes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ManagedResource for Toggle {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Source
        }

        fn key(&self) -> String {
            "toggle".to_string()
        }

        async fn prepare(&mut self) -> Result<()> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn check(&mut self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::IoError("disk gone".into()))
            }
        }

        async fn remove(&mut self) -> Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn toggle(healthy: bool) -> (Tracked<Toggle>, Arc<AtomicBool>) {
        let p = Toggle::default();
        p.healthy.store(healthy, Ordering::SeqCst);
        let flag = p.healthy.clone();
        (Tracked::new(p), flag)
    }

    #[tokio::test]
    async fn test_removed_only_allows_prepare() {
        let (mut t, _) = toggle(true);
        assert!(t.check().await.is_err());
        assert!(t.activate().await.is_err());
        assert!(t.deactivate().await.is_err());
        t.prepare().await.unwrap();
        assert_eq!(t.record().status, Status::Prepared);
        assert_eq!(t.record().flag, CheckFlag::Unchecked);
    }

    #[tokio::test]
    async fn test_active_only_allows_deactivate_or_remove() {
        let (mut t, _) = toggle(true);
        t.prepare().await.unwrap();
        assert!(t.check().await.unwrap());
        t.activate().await.unwrap();
        assert!(t.is_active());

        assert!(t.prepare().await.is_err());
        assert!(t.check().await.is_err());
        assert!(t.activate().await.is_err());

        t.deactivate().await.unwrap();
        assert_eq!(t.record().status, Status::Prepared);
        assert_eq!(t.record().flag, CheckFlag::Unchecked);
    }

    #[tokio::test]
    async fn test_activate_failed_defers_until_check_passes() {
        let (mut t, healthy) = toggle(false);
        t.prepare().await.unwrap();
        assert!(!t.check().await.unwrap());
        assert_eq!(t.record().flag, CheckFlag::Failed);
        assert!(t.record().last_error.is_some());

        t.activate().await.unwrap();
        assert_eq!(t.record().status, Status::Prepared);
        assert_eq!(t.record().flag, CheckFlag::FailedReactivate);

        // still failing keeps the pending reactivation
        assert!(!t.check().await.unwrap());
        assert_eq!(t.record().flag, CheckFlag::FailedReactivate);

        healthy.store(true, Ordering::SeqCst);
        assert!(t.check().await.unwrap());
        assert!(t.is_active());
        assert_eq!(t.record().flag, CheckFlag::Clear);
    }

    #[tokio::test]
    async fn test_deactivate_cancels_pending_reactivation() {
        let (mut t, _) = toggle(false);
        t.prepare().await.unwrap();
        t.check().await.unwrap();
        t.activate().await.unwrap();
        t.deactivate().await.unwrap();
        assert_eq!(t.record().flag, CheckFlag::Failed);
    }

    #[tokio::test]
    async fn test_edit_forces_prepare_before_check() {
        let (mut t, _) = toggle(true);
        t.prepare().await.unwrap();
        t.check().await.unwrap();
        t.activate().await.unwrap();

        t.mark_changed();
        assert_eq!(t.record().status, Status::Prepared);
        assert_eq!(t.record().flag, CheckFlag::Changed);
        assert!(t.check().await.is_err());
        assert!(t.activate().await.is_err());

        t.prepare().await.unwrap();
        // sync = remove + prepare
        assert_eq!(t.resource().prepares.load(Ordering::SeqCst), 2);
        assert_eq!(t.resource().removes.load(Ordering::SeqCst), 1);
        assert!(t.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_from_any_state_is_idempotent() {
        let (mut t, _) = toggle(true);
        t.remove().await.unwrap();
        assert_eq!(t.resource().removes.load(Ordering::SeqCst), 0);

        t.prepare().await.unwrap();
        t.check().await.unwrap();
        t.activate().await.unwrap();
        t.remove().await.unwrap();
        assert_eq!(t.record().status, Status::Removed);
        assert_eq!(t.resource().removes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_needs_recheck() {
        let now = Utc::now();
        let mut record = StatusRecord {
            status: Status::Prepared,
            flag: CheckFlag::Clear,
            last_checked: Some(now - Duration::days(7)),
            last_error: None,
        };
        assert!(record.needs_recheck(now, 6));
        record.last_checked = Some(now - Duration::days(1));
        assert!(!record.needs_recheck(now, 6));
        record.status = Status::Active;
        assert!(!record.needs_recheck(now, 0));
    }

    #[test]
    fn test_describe() {
        let record = StatusRecord {
            status: Status::Prepared,
            flag: CheckFlag::FailedReactivate,
            ..Default::default()
        };
        assert_eq!(record.describe(), "prepared (failed-reactivate)");
        assert_eq!(StatusRecord::default().describe(), "removed");
    }
}
