// tests/pipeline.rs

//! End-to-end submissions through the daemon: build, install, rollback,
//! migration and failure handling.

mod common;

use autobuild::build::{JobSpec, JobState, OutcomeState, ResultKind};
use autobuild::daemon::{Command, CommandOutput};
use autobuild::federation::protocol::{BuildRequest, EncodedFile};
use autobuild::repository::{DistributionString, MigrationOutcome};
use autobuild::{Error, PackageStatus};
use common::{DEFAULT_REPOSITORY, Harness, Step, upload};

const SHALLOW: &str = r#"
[[layouts]]
name = "Shallow"

[[layouts.suites]]
name = "unstable"
uploadable = true
rollback = 2
migrates_to = "testing"

[[layouts.suites]]
name = "testing"
rollback = 2

[[repositories]]
identity = "test"
layout = "Shallow"
distributions = ["sid"]
"#;

fn dist(text: &str) -> DistributionString {
    text.parse().unwrap()
}

#[tokio::test]
async fn test_timeout_then_failure_leaves_repository_untouched() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    h.builder.script("armel", &[Step::Hang, Step::Fail]);

    let report = h
        .daemon
        .submit(upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["any"]))
        .await
        .unwrap();

    assert_eq!(report.status, PackageStatus::Failed);
    assert_eq!(report.outcome, Some(OutcomeState::PartialFailure));
    assert!(report.installed.is_none());

    let failure = report.failure.unwrap();
    assert_eq!(failure.architectures.len(), 2);
    let armel = &failure.architectures["armel"];
    assert_eq!(armel.state, JobState::Failed);
    assert_eq!(armel.attempts, 2);
    assert!(armel.log.contains("timed out"));
    assert!(armel.log.contains("Status: attempted"));
    assert!(failure.architectures["amd64"].log.contains("Status: successful"));

    let repo = h.daemon.repository(&dist("sid-test-unstable")).unwrap();
    assert!(repo.find_active("foo", &dist("sid-test-unstable")).unwrap().is_none());
    assert_eq!(h.daemon.pool().active_sessions(), 0);
    assert_eq!(h.sessions.open(), 0);
}

#[tokio::test]
async fn test_rollback_ring_keeps_configured_depth() {
    let h = Harness::new(SHALLOW).await;
    for version in ["1.0-1~test100+1", "1.1-1~test100+1", "1.2-1~test100+1", "1.3-1~test100+1"] {
        let report = h
            .daemon
            .submit(upload("foo", version, "sid-test-unstable", &["amd64"]))
            .await
            .unwrap();
        assert_eq!(report.status, PackageStatus::Installed, "{}", version);
    }

    let unstable = dist("sid-test-unstable");
    let repo = h.daemon.repository(&unstable).unwrap();
    let ring = repo.ring("foo", &unstable).unwrap();
    assert_eq!(ring.active().unwrap().version, "1.3-1~test100+1");
    let rollbacks: Vec<&str> = ring.rollbacks().map(|e| e.version.as_str()).collect();
    assert_eq!(rollbacks, vec!["1.2-1~test100+1", "1.1-1~test100+1"]);

    // the oldest version fell out of the ring and cannot be restored
    assert!(ring.rollbacks().all(|e| e.version != "1.0-1~test100+1"));
}

#[tokio::test]
async fn test_restore_from_rollback_slot() {
    let h = Harness::new(SHALLOW).await;
    for version in ["1.0-1~test100+1", "1.1-1~test100+1"] {
        h.daemon
            .submit(upload("foo", version, "sid-test-unstable", &["amd64"]))
            .await
            .unwrap();
    }
    let unstable = dist("sid-test-unstable");
    h.daemon
        .execute(
            Command::RemovePackage {
                package: "foo".into(),
                distribution: unstable.clone(),
            },
            Some("remove"),
        )
        .await
        .unwrap();

    // 1.1 now sits in rollback 0; restoring it makes it active again
    let output = h
        .daemon
        .execute(
            Command::Migrate {
                package: "foo".into(),
                distribution: dist("sid-test-unstable-rollback0"),
            },
            Some("migrate"),
        )
        .await
        .unwrap();
    match output {
        CommandOutput::Migrated {
            outcome: MigrationOutcome::Restored { entry, slot },
        } => {
            assert_eq!(slot, 0);
            assert_eq!(entry.version, "1.1-1~test100+1");
        }
        other => panic!("unexpected output {:?}", other),
    }
    let repo = h.daemon.repository(&unstable).unwrap();
    assert_eq!(
        repo.find_active("foo", &unstable).unwrap().unwrap().version,
        "1.1-1~test100+1"
    );
}

#[tokio::test]
async fn test_migrate_requires_confirmation() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    let report = h
        .daemon
        .submit(upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["any"]))
        .await
        .unwrap();
    assert_eq!(report.status, PackageStatus::Installed);

    let migrate = Command::Migrate {
        package: "foo".into(),
        distribution: dist("sid-test-unstable"),
    };
    let err = h.daemon.execute(migrate.clone(), None).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired(_)));
    let err = h.daemon.execute(migrate.clone(), Some("remove")).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired(_)));

    let testing = dist("sid-test-testing");
    let repo = h.daemon.repository(&testing).unwrap();
    assert!(repo.find_active("foo", &testing).unwrap().is_none());

    h.daemon.execute(migrate.clone(), Some("migrate")).await.unwrap();
    let entry = repo.find_active("foo", &testing).unwrap().unwrap();
    assert_eq!(entry.version, "1.0-1~test100+1");

    // migration copies; unstable keeps its entry and a second run is a no-op
    let unstable = dist("sid-test-unstable");
    assert!(repo.find_active("foo", &unstable).unwrap().is_some());
    let again = h.daemon.execute(migrate, Some("migrate")).await.unwrap();
    assert!(matches!(
        again,
        CommandOutput::Migrated {
            outcome: MigrationOutcome::AlreadyPresent { .. }
        }
    ));
}

#[tokio::test]
async fn test_crashing_builder_releases_sessions() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    h.builder.script("amd64", &[Step::Panic]);

    let report = h
        .daemon
        .submit(upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["any"]))
        .await
        .unwrap();

    assert_eq!(report.status, PackageStatus::Failed);
    assert_eq!(report.outcome, Some(OutcomeState::PartialFailure));
    let failure = report.failure.unwrap();
    assert_eq!(failure.architectures["amd64"].state, JobState::Failed);
    assert_eq!(
        failure.architectures["amd64"].detail.as_deref(),
        Some("builder crashed")
    );
    assert_eq!(failure.architectures["armel"].state, JobState::Succeeded);

    assert_eq!(h.daemon.pool().active_sessions(), 0);
    assert_eq!(h.sessions.open(), 0);

    // the pool is still usable afterwards
    let next = h
        .daemon
        .submit(upload("foo", "1.1-1~test100+1", "sid-test-unstable", &["any"]))
        .await
        .unwrap();
    assert_eq!(next.status, PackageStatus::Installed);
    assert_eq!(h.sessions.open(), 0);
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    h.daemon
        .submit(upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["amd64"]))
        .await
        .unwrap();
    h.daemon
        .submit(upload("bar", "2.0-1", "sid-test-unstable", &["amd64"]))
        .await
        .unwrap();

    let store = autobuild::db::Store::open(h.temp.path().join("autobuild.db")).unwrap();
    let rows = store
        .with(|conn| autobuild::db::models::SubmissionRow::list_recent(conn, 10))
        .unwrap();
    assert_eq!(rows.len(), 2);
    let statuses: Vec<&str> = rows.iter().map(|r| r.status.as_str()).collect();
    assert!(statuses.contains(&"installed"));
    assert!(statuses.contains(&"rejected"));
}

fn spool_upload(h: &Harness, name: &str, distribution: &str) {
    let incoming = h.daemon.config().daemon.spool_dir().join("incoming");
    std::fs::create_dir_all(&incoming).unwrap();
    let upload = serde_json::json!({
        "package": "foo",
        "version": "1.0-1~test100+1",
        "distribution": distribution,
        "architectures": ["amd64"],
        "dsc": "/incoming/foo_1.0-1~test100+1.dsc",
    });
    std::fs::write(incoming.join(name), upload.to_string()).unwrap();
}

#[tokio::test]
async fn test_upload_to_meta_distribution() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    spool_upload(&h, "foo.json", "unstable");

    let mut claimed = h.daemon.take_incoming();
    assert_eq!(claimed.len(), 1);
    let submission = claimed.remove(0);
    assert_eq!(submission.distribution, dist("sid-test-unstable"));

    let report = h.daemon.submit(submission).await.unwrap();
    assert_eq!(report.status, PackageStatus::Installed);
    let unstable = dist("sid-test-unstable");
    let repo = h.daemon.repository(&unstable).unwrap();
    assert_eq!(
        repo.find_active("foo", &unstable).unwrap().unwrap().version,
        "1.0-1~test100+1"
    );
}

#[tokio::test]
async fn test_ambiguous_meta_distribution_is_not_claimed() {
    let two_repositories = format!(
        "{}\n[[repositories]]\nidentity = \"prod\"\ndistributions = [\"sid\"]\n",
        DEFAULT_REPOSITORY
    );
    let h = Harness::new(&two_repositories).await;
    spool_upload(&h, "foo.json", "unstable");
    spool_upload(&h, "bar.json", "sid-prod-unstable");

    let claimed = h.daemon.take_incoming();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].distribution, dist("sid-prod-unstable"));
    let incoming = h.daemon.config().daemon.spool_dir().join("incoming");
    assert!(incoming.join("foo.bad").exists());
}

#[tokio::test]
async fn test_operator_cancel_stops_building_submission() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    h.builder.script("amd64", &[Step::Hang, Step::Hang]);
    h.builder.script("armel", &[Step::Hang, Step::Hang]);
    let key = "foo_1.0-1~test100+1";

    let cancel = async {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let output = h
                .daemon
                .execute(Command::Cancel { key: key.into() }, None)
                .await
                .unwrap();
            if let CommandOutput::Cancelled {
                submission: Some(id),
                ..
            } = output
            {
                return id;
            }
        }
        panic!("{} never started building", key);
    };
    let (report, cancelled) = tokio::join!(
        h.daemon
            .submit(upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["any"])),
        cancel
    );
    let report = report.unwrap();

    assert_eq!(report.submission_id, Some(cancelled));
    assert_eq!(report.status, PackageStatus::Failed);
    assert_eq!(report.outcome, Some(OutcomeState::Cancelled));
    assert!(report.installed.is_none());
    assert_eq!(h.daemon.pool().active_sessions(), 0);
    assert_eq!(h.sessions.open(), 0);

    // nothing left to cancel
    let again = h
        .daemon
        .execute(Command::Cancel { key: key.into() }, None)
        .await
        .unwrap();
    assert!(matches!(again, CommandOutput::Cancelled { submission: None, .. }));
}

#[tokio::test]
async fn test_spooled_cancel_requests_are_claimed_once() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    let spool = h.daemon.config().daemon.spool_dir();
    autobuild::daemon::Daemon::request_cancel(&spool, "foo_1.0-1").unwrap();
    assert!(autobuild::daemon::Daemon::request_cancel(&spool, "../foo").is_err());

    assert_eq!(h.daemon.take_cancel_requests(), vec!["foo_1.0-1".to_string()]);
    assert!(h.daemon.take_cancel_requests().is_empty());
}

#[tokio::test]
async fn test_show_lists_every_distribution_with_rollbacks() {
    let h = Harness::new(SHALLOW).await;
    for version in ["1.0-1~test100+1", "1.1-1~test100+1"] {
        h.daemon
            .submit(upload("foo", version, "sid-test-unstable", &["amd64"]))
            .await
            .unwrap();
    }
    h.daemon
        .execute(
            Command::Migrate {
                package: "foo".into(),
                distribution: dist("sid-test-unstable"),
            },
            Some("migrate"),
        )
        .await
        .unwrap();

    let output = h
        .daemon
        .execute(Command::Show { package: "foo".into() }, None)
        .await
        .unwrap();
    let CommandOutput::Shown {
        package,
        distributions,
    } = output
    else {
        panic!("unexpected output {:?}", output);
    };
    assert_eq!(package, "foo");
    assert_eq!(distributions.len(), 2);

    let unstable = distributions
        .iter()
        .find(|d| d.distribution == "sid-test-unstable")
        .unwrap();
    assert_eq!(unstable.active.as_ref().unwrap().version, "1.1-1~test100+1");
    let rollbacks: Vec<&str> = unstable.rollbacks.iter().map(|e| e.version.as_str()).collect();
    assert_eq!(rollbacks, vec!["1.0-1~test100+1"]);

    let testing = distributions
        .iter()
        .find(|d| d.distribution == "sid-test-testing")
        .unwrap();
    assert_eq!(testing.active.as_ref().unwrap().version, "1.1-1~test100+1");
    assert!(testing.rollbacks.is_empty());

    let nothing = h
        .daemon
        .execute(Command::Show { package: "bar".into() }, None)
        .await
        .unwrap();
    assert!(matches!(nothing, CommandOutput::Shown { ref distributions, .. } if distributions.is_empty()));
}

#[tokio::test]
async fn test_retry_failed_submission() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    h.builder.script("amd64", &[Step::Fail]);
    let first = h
        .daemon
        .submit(upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["amd64"]))
        .await
        .unwrap();
    assert_eq!(first.status, PackageStatus::Failed);

    let retry = Command::Retry {
        key: "foo_1.0-1~test100+1".into(),
    };
    let err = h.daemon.execute(retry.clone(), None).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired(_)));

    let output = h.daemon.execute(retry.clone(), Some("retry")).await.unwrap();
    let CommandOutput::Retried { report } = output else {
        panic!("unexpected output {:?}", output);
    };
    assert_eq!(report.status, PackageStatus::Installed);
    assert_eq!(report.submission_id, first.submission_id);

    // installed submissions are not retried
    let err = h.daemon.execute(retry, Some("retry")).await.unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
    let err = h
        .daemon
        .execute(Command::Retry { key: "bar_2.0".into() }, Some("retry"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_build_for_peer_reports_timeout() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    h.builder.script("amd64", &[Step::Hang]);
    let request = BuildRequest {
        request_id: "req-7".into(),
        origin: "other".into(),
        submission: upload("foo", "1.0-1~test100+1", "sid-test-unstable", &["amd64"]),
        job: JobSpec::new("amd64"),
        sources: vec![EncodedFile {
            name: "foo_1.0-1~test100+1.dsc".into(),
            data: "ZHNj".into(),
        }],
    };

    let result = h.daemon.serve_build(request).await;
    assert_eq!(result.kind, ResultKind::TimedOut);
    assert!(result.detail.contains("timed out on test"));
    assert_eq!(h.daemon.pool().active_sessions(), 0);
    assert_eq!(h.sessions.open(), 0);
}
