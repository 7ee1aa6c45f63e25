// src/repository/ring.rs

//! Bounded rollback history per (package, distribution)
//!
//! A ring holds at most one active entry plus up to `depth` rollback
//! entries, newest first. Installing over an active entry shifts it into
//! rollback slot 0; whatever falls off the end is handed back to the caller
//! as discarded.

use super::version::compare_versions;
use crate::db::models::EntryRow;
use crate::db::models::parse_timestamp;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// One installed source package version in one distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub package: String,
    pub version: String,
    pub distribution: String,
    pub component: String,
    /// Pool-relative artifact paths
    pub artifacts: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

impl RepositoryEntry {
    pub fn new(package: &str, version: &str, distribution: &str, component: &str) -> Self {
        Self {
            package: package.to_string(),
            version: version.to_string(),
            distribution: distribution.to_string(),
            component: component.to_string(),
            artifacts: Vec::new(),
            installed_at: Utc::now(),
        }
    }

    fn to_row(&self, repository: &str, slot: i64) -> EntryRow {
        EntryRow {
            repository: repository.to_string(),
            package: self.package.clone(),
            distribution: self.distribution.clone(),
            slot,
            version: self.version.clone(),
            component: self.component.clone(),
            artifacts: self.artifacts.clone(),
            installed_at: self.installed_at.to_rfc3339(),
        }
    }

    fn from_row(row: &EntryRow) -> Result<Self> {
        Ok(Self {
            package: row.package.clone(),
            version: row.version.clone(),
            distribution: row.distribution.clone(),
            component: row.component.clone(),
            artifacts: row.artifacts.clone(),
            installed_at: parse_timestamp(&row.installed_at)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackRing {
    depth: usize,
    active: Option<RepositoryEntry>,
    rollbacks: VecDeque<RepositoryEntry>,
}

impl RollbackRing {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            active: None,
            rollbacks: VecDeque::with_capacity(depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn active(&self) -> Option<&RepositoryEntry> {
        self.active.as_ref()
    }

    /// Rollback entries, slot 0 (most recent) first
    pub fn rollbacks(&self) -> impl Iterator<Item = &RepositoryEntry> {
        self.rollbacks.iter()
    }

    pub fn rollback(&self, slot: usize) -> Option<&RepositoryEntry> {
        self.rollbacks.get(slot)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.rollbacks.is_empty()
    }

    fn shift_in(&mut self, previous: RepositoryEntry) -> Vec<RepositoryEntry> {
        self.rollbacks.push_front(previous);
        let mut discarded = Vec::new();
        while self.rollbacks.len() > self.depth {
            if let Some(oldest) = self.rollbacks.pop_back() {
                discarded.push(oldest);
            }
        }
        discarded
    }

    /// Make `entry` active, shifting the previous active entry into slot 0
    ///
    /// Returns the entries pushed out of the ring.
    pub fn install(&mut self, entry: RepositoryEntry) -> Vec<RepositoryEntry> {
        match self.active.replace(entry) {
            Some(previous) => self.shift_in(previous),
            None => Vec::new(),
        }
    }

    /// Like [`install`](Self::install), but only over an older active version
    pub fn install_newer(&mut self, entry: RepositoryEntry) -> Result<Vec<RepositoryEntry>> {
        if let Some(active) = &self.active
            && compare_versions(&entry.version, &active.version) != Ordering::Greater
        {
            return Err(Error::Rejected(format!(
                "{} {} is not newer than active {} in {}",
                entry.package, entry.version, active.version, active.distribution
            )));
        }
        Ok(self.install(entry))
    }

    /// Take the active entry out of service, keeping it as rollback 0
    ///
    /// Returns the removed entry (if any) and the entries pushed out.
    pub fn remove_active(&mut self) -> (Option<RepositoryEntry>, Vec<RepositoryEntry>) {
        match self.active.take() {
            Some(previous) => {
                let removed = previous.clone();
                let discarded = self.shift_in(previous);
                (Some(removed), discarded)
            }
            None => (None, Vec::new()),
        }
    }

    /// Promote a rollback entry back to active
    ///
    /// Refused while a newer version is active. An older active version is
    /// shifted into the ring like on install.
    pub fn restore(&mut self, slot: usize) -> Result<Vec<RepositoryEntry>> {
        let candidate = self.rollbacks.get(slot).ok_or_else(|| {
            Error::NotFound(format!("rollback slot {} (ring holds {})", slot, self.rollbacks.len()))
        })?;

        if let Some(active) = &self.active
            && compare_versions(&active.version, &candidate.version) != Ordering::Less
        {
            return Err(Error::Rejected(format!(
                "{} {} is active; cannot restore {} from rollback {}",
                active.package, active.version, candidate.version, slot
            )));
        }

        let mut entry = match self.rollbacks.remove(slot) {
            Some(entry) => entry,
            None => return Ok(Vec::new()),
        };
        entry.installed_at = Utc::now();
        Ok(self.install(entry))
    }

    /// Drop a rollback entry permanently
    pub fn purge(&mut self, slot: usize) -> Option<RepositoryEntry> {
        self.rollbacks.remove(slot)
    }

    /// Persisted form: slot 0 active, slot k rollback k-1
    pub fn to_rows(&self, repository: &str) -> Vec<EntryRow> {
        let mut rows = Vec::with_capacity(self.rollbacks.len() + 1);
        if let Some(active) = &self.active {
            rows.push(active.to_row(repository, 0));
        }
        for (i, entry) in self.rollbacks.iter().enumerate() {
            rows.push(entry.to_row(repository, i as i64 + 1));
        }
        rows
    }

    /// Rebuild from persisted rows; rows beyond `depth` are dropped
    pub fn from_rows(depth: usize, rows: &[EntryRow]) -> Result<Self> {
        let mut ring = Self::new(depth);
        let mut rollbacks: Vec<(i64, RepositoryEntry)> = Vec::new();
        for row in rows {
            let entry = RepositoryEntry::from_row(row)?;
            if row.slot == 0 {
                ring.active = Some(entry);
            } else {
                rollbacks.push((row.slot, entry));
            }
        }
        rollbacks.sort_by_key(|(slot, _)| *slot);
        ring.rollbacks = rollbacks
            .into_iter()
            .map(|(_, entry)| entry)
            .take(depth)
            .collect();
        Ok(ring)
    }
}
