// src/repository/promotion.rs

//! Suite promotion: migrate, rollback restoration, quiescence-driven
//! automatic migration and port version planning

use super::distribution::DistributionString;
use super::ring::RepositoryEntry;
use super::version::DebianVersion;
use super::Repository;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Confirmation token for migrations
pub const MIGRATE: &str = "migrate";

/// What a migrate call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum MigrationOutcome {
    /// Copied into the target suite
    Migrated { entry: RepositoryEntry, from: String },
    /// Rollback entry made active again
    Restored { entry: RepositoryEntry, slot: u32 },
    /// Target already holds this version
    AlreadyPresent { entry: RepositoryEntry },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PromotionEngine;

impl PromotionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Operator migration of `package` out of `from`
    ///
    /// `from` may be a `-rollbackN` distribution, in which case the rollback
    /// entry is restored in place. `confirm` must equal `"migrate"`.
    pub async fn migrate(
        &self,
        repo: &Repository,
        package: &str,
        from: &DistributionString,
        confirm: Option<&str>,
    ) -> Result<MigrationOutcome> {
        if confirm != Some(MIGRATE) {
            return Err(Error::ConfirmationRequired(MIGRATE.to_string()));
        }
        self.migrate_unconfirmed(repo, package, from).await
    }

    async fn migrate_unconfirmed(
        &self,
        repo: &Repository,
        package: &str,
        from: &DistributionString,
    ) -> Result<MigrationOutcome> {
        if let Some(slot) = from.rollback {
            let entry = repo.restore(package, from, slot as usize).await?;
            return Ok(MigrationOutcome::Restored { entry, slot });
        }

        let (_, suite) = repo.resolve(from)?;
        let target_suite = suite.migrates_to.as_deref().ok_or_else(|| {
            Error::Rejected(format!("{}: suite {} does not migrate", from, suite.name))
        })?;
        let to = DistributionString::new(&from.codename, &from.repository, target_suite);

        repo.copy_active(package, from, &to).await
    }

    /// Migrate every entry that sat unchanged in an automatically migrating
    /// suite for at least its quiescence period
    ///
    /// Failures are logged per entry and do not stop the sweep.
    pub async fn auto_migrate(&self, repo: &Repository, now: DateTime<Utc>) -> Result<Vec<MigrationOutcome>> {
        let mut outcomes = Vec::new();
        for suite in repo.layout().suites.iter().filter(|s| s.auto_migrate) {
            let quiescence = Duration::days(suite.quiescence_days);
            for distribution in repo.distributions() {
                let dist = DistributionString::new(&distribution.codename, repo.identity(), &suite.name);
                for entry in repo.list_active(&dist)? {
                    if now - entry.installed_at < quiescence {
                        continue;
                    }
                    match self.migrate_unconfirmed(repo, &entry.package, &dist).await {
                        Ok(MigrationOutcome::AlreadyPresent { .. }) => {}
                        Ok(outcome) => {
                            info!(
                                "[promotion] auto-migrated {} {} from {}",
                                entry.package, entry.version, dist
                            );
                            outcomes.push(outcome);
                        }
                        Err(e) => warn!(
                            "[promotion] auto-migration of {} {} from {} failed: {}",
                            entry.package, entry.version, dist, e
                        ),
                    }
                }
            }
        }
        Ok(outcomes)
    }

    /// Version a port of `version` from `from` into `to` must carry
    ///
    /// Ports within the same distribution are rebuilds. Rollback targets and
    /// suites that do not take uploads are refused.
    pub fn port_version(
        &self,
        repo: &Repository,
        version: &str,
        from: &DistributionString,
        to: &DistributionString,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if to.is_rollback() {
            return Err(Error::Rejected(format!("cannot port to rollback distribution {}", to)));
        }
        let (to_distribution, to_suite) = repo.resolve(to)?;
        if !to_suite.uploadable {
            return Err(Error::Rejected(format!(
                "cannot port to {}: suite {} takes no uploads",
                to, to_suite.name
            )));
        }

        let parsed = DebianVersion::parse(version)?;
        if from.base() == to.base() {
            return Ok(parsed.internal_rebuild(now));
        }

        let layout = repo.layout();
        let to_default = layout.default_version(to_suite, repo.identity(), &to_distribution.base_version);
        match repo.resolve(&from.base()) {
            Ok((from_distribution, from_suite)) => {
                let restriction = layout.version_restriction(
                    from_suite,
                    repo.identity(),
                    &from_distribution.base_version,
                )?;
                parsed.internal_port(&restriction, &to_default)
            }
            // the source lives in another repository: external port
            Err(_) => Ok(parsed.external_port(&to_default)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::repository::{Distribution, Layout};
    use std::sync::Arc;

    fn repo(dir: &std::path::Path, auto: bool) -> Repository {
        let mut layout = Layout::default_layout();
        if auto {
            for suite in &mut layout.suites {
                if suite.name == "unstable" {
                    suite.auto_migrate = true;
                    suite.quiescence_days = 3;
                }
            }
        }
        Repository::new(
            "test",
            Arc::new(layout),
            vec![
                Distribution::new("sid", "100", &["amd64"]),
                Distribution::new("bookworm", "120", &["amd64"]),
            ],
            Arc::new(Store::in_memory().unwrap()),
            dir,
        )
    }

    fn dist(s: &str) -> DistributionString {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_migrate_requires_confirmation() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repo(temp.path(), false);
        let unstable = dist("sid-test-unstable");
        repo.install("foo", "1.0-1~test100+1", &unstable, "main", &[]).await.unwrap();

        let engine = PromotionEngine::new();
        let err = engine.migrate(&repo, "foo", &unstable, None).await.unwrap_err();
        assert!(matches!(err, Error::ConfirmationRequired(ref c) if c == "migrate"));
        assert!(engine.migrate(&repo, "foo", &unstable, Some("yes")).await.is_err());
        assert!(repo.find_active("foo", &dist("sid-test-testing")).unwrap().is_none());

        let outcome = engine
            .migrate(&repo, "foo", &unstable, Some("migrate"))
            .await
            .unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { .. }));
        let testing = repo.find_active("foo", &dist("sid-test-testing")).unwrap().unwrap();
        assert_eq!(testing.version, "1.0-1~test100+1");

        // repeating is a no-op
        let again = engine
            .migrate(&repo, "foo", &unstable, Some("migrate"))
            .await
            .unwrap();
        assert!(matches!(again, MigrationOutcome::AlreadyPresent { .. }));
    }

    #[tokio::test]
    async fn test_migrate_rejected_by_target_restriction() {
        let temp = tempfile::tempdir().unwrap();
        let mut layout = Layout::default_layout();
        for suite in &mut layout.suites {
            if suite.name == "testing" {
                suite.version_restriction = Some(r"~{rid}{nbv}\+[2-9]".into());
            }
        }
        let repo = Repository::new(
            "test",
            Arc::new(layout),
            vec![Distribution::new("sid", "100", &["amd64"])],
            Arc::new(Store::in_memory().unwrap()),
            temp.path(),
        );
        let unstable = dist("sid-test-unstable");
        repo.install("foo", "1.0-1~test100+1", &unstable, "main", &[]).await.unwrap();

        let err = PromotionEngine::new()
            .migrate(&repo, "foo", &unstable, Some("migrate"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionRestriction(_)));
        assert!(repo.find_active("foo", &dist("sid-test-testing")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migrate_never_downgrades_target() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repo(temp.path(), false);
        let unstable = dist("sid-test-unstable");
        let testing = dist("sid-test-testing");
        repo.install("foo", "1.0-1~test100+1", &unstable, "main", &[]).await.unwrap();
        repo.install("foo", "1.1-1~test100+1", &testing, "main", &[]).await.unwrap();

        let err = PromotionEngine::new()
            .migrate(&repo, "foo", &unstable, Some("migrate"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        let active = repo.find_active("foo", &testing).unwrap().unwrap();
        assert_eq!(active.version, "1.1-1~test100+1");
        assert_eq!(repo.ring("foo", &testing).unwrap().rollbacks().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_migrations_copy_once() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repo(temp.path(), false);
        let unstable = dist("sid-test-unstable");
        repo.install("foo", "1.0-1~test100+1", &unstable, "main", &[]).await.unwrap();

        let engine = PromotionEngine::new();
        let (a, b) = tokio::join!(
            engine.migrate(&repo, "foo", &unstable, Some("migrate")),
            engine.migrate(&repo, "foo", &unstable, Some("migrate")),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let migrated = outcomes
            .iter()
            .filter(|o| matches!(o, MigrationOutcome::Migrated { .. }))
            .count();
        assert_eq!(migrated, 1);
        assert!(outcomes.iter().any(|o| matches!(o, MigrationOutcome::AlreadyPresent { .. })));
        assert_eq!(repo.ring("foo", &dist("sid-test-testing")).unwrap().rollbacks().count(), 0);
    }

    #[tokio::test]
    async fn test_migrate_from_rollback_restores() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repo(temp.path(), false);
        let unstable = dist("sid-test-unstable");
        repo.install("foo", "1.0-1~test100+1", &unstable, "main", &[]).await.unwrap();
        repo.remove("foo", &unstable).await.unwrap();

        let outcome = PromotionEngine::new()
            .migrate(&repo, "foo", &dist("sid-test-unstable-rollback0"), Some("migrate"))
            .await
            .unwrap();
        assert!(matches!(outcome, MigrationOutcome::Restored { slot: 0, .. }));
        assert!(repo.find_active("foo", &unstable).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_auto_migrate_after_quiescence() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repo(temp.path(), true);
        let unstable = dist("sid-test-unstable");
        repo.install("foo", "1.0-1~test100+1", &unstable, "main", &[]).await.unwrap();

        let engine = PromotionEngine::new();
        let early = engine.auto_migrate(&repo, Utc::now()).await.unwrap();
        assert!(early.is_empty());

        let later = engine
            .auto_migrate(&repo, Utc::now() + Duration::days(4))
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
        assert!(repo.find_active("foo", &dist("sid-test-testing")).unwrap().is_some());
    }

    #[test]
    fn test_port_versions() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repo(temp.path(), false);
        let engine = PromotionEngine::new();
        let now = Utc::now();

        let ported = engine
            .port_version(
                &repo,
                "1.2.3-1~test100+4",
                &dist("sid-test-unstable"),
                &dist("bookworm-test-unstable"),
                now,
            )
            .unwrap();
        assert_eq!(ported, "1.2.3-1~test120+4");

        let rebuilt = engine
            .port_version(
                &repo,
                "1.2.3-1~test100+4",
                &dist("sid-test-unstable"),
                &dist("sid-test-unstable"),
                now,
            )
            .unwrap();
        assert!(rebuilt.starts_with("1.2.3-1~test100+4+rebuilt"));

        let external = engine
            .port_version(
                &repo,
                "1.2.3-1",
                &dist("sid-other-unstable"),
                &dist("bookworm-test-unstable"),
                now,
            )
            .unwrap();
        assert_eq!(external, "1.2.3-1~test120+1");

        assert!(engine
            .port_version(&repo, "1.0", &dist("sid-test-unstable"), &dist("sid-test-testing"), now)
            .is_err());
        assert!(engine
            .port_version(
                &repo,
                "1.0",
                &dist("sid-test-unstable"),
                &dist("sid-test-unstable-rollback1"),
                now
            )
            .is_err());
    }
}
