// tests/resources.rs

//! Managed resource state across daemon restarts.

mod common;

use autobuild::chroot::Backend;
use autobuild::status::{CheckFlag, ResourceKind, Status};
use common::{DEFAULT_REPOSITORY, Harness, config};

#[tokio::test]
async fn test_edited_chroot_comes_back_changed() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    assert!(h.daemon.pool().is_hosted("sid", "amd64"));

    let mut edited = config(h.temp.path(), DEFAULT_REPOSITORY);
    edited.chroots[0].backend = Backend::BtrfsSnapshot;
    let daemon = h.reopen(edited);

    assert!(!daemon.pool().is_hosted("sid", "amd64"));
    assert!(daemon.pool().is_hosted("sid", "armel"));

    let listing = daemon.resources().await;
    let amd64 = listing
        .iter()
        .find(|r| r.kind == ResourceKind::Chroot && r.key == "mbd-sid-amd64")
        .unwrap();
    assert_eq!(amd64.record.status, Status::Prepared);
    assert_eq!(amd64.record.flag, CheckFlag::Changed);

    // untouched resources keep their state
    let repo = listing
        .iter()
        .find(|r| r.kind == ResourceKind::Repository && r.key == "test")
        .unwrap();
    assert_eq!(repo.record.status, Status::Active);
}

#[tokio::test]
async fn test_unchanged_configuration_restores_active() {
    let h = Harness::new(DEFAULT_REPOSITORY).await;
    let daemon = h.reopen(config(h.temp.path(), DEFAULT_REPOSITORY));

    assert!(daemon.pool().is_hosted("sid", "amd64"));
    assert!(daemon.pool().is_hosted("sid", "armel"));
    assert!(daemon.resources().await.iter().all(|r| r.record.status == Status::Active));
}
