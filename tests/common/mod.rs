// tests/common/mod.rs

//! Shared fakes and fixtures for integration tests.
//!
//! The daemon is wired to in-process stand-ins for schroot, sbuild and the
//! peer client, so whole submissions run without a Debian host.

#![allow(dead_code)]

use async_trait::async_trait;
use autobuild::build::{BuildResult, Builder, JobSpec, ResultKind, Submission};
use autobuild::chroot::{ChrootSession, CommandRunner, SessionProvider};
use autobuild::config::Config;
use autobuild::daemon::{Daemon, ResourceRef, Services};
use autobuild::db::Store;
use autobuild::federation::protocol::Advertisement;
use autobuild::federation::{PeerEndpoint, RemoteBuilder};
use autobuild::status::{Operation, ResourceKind};
use autobuild::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

/// What the fake builder does on its next call for an architecture
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail,
    Hang,
    Panic,
}

/// Plays back per-architecture steps and writes a .deb for each success
pub struct FakeBuilder {
    work_dir: PathBuf,
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            steps: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, arch: &str, steps: &[Step]) {
        self.steps
            .lock()
            .insert(arch.to_string(), steps.iter().cloned().collect());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(&self, sub: &Submission, job: &JobSpec, session: &ChrootSession) -> BuildResult {
        self.calls
            .lock()
            .push(format!("{} {} on {}", sub.package, job.architecture, session.schroot_name()));
        let step = self
            .steps
            .lock()
            .get_mut(&job.architecture)
            .and_then(|s| s.pop_front())
            .unwrap_or(Step::Succeed);

        match step {
            Step::Succeed => {
                let deb = self.work_dir.join(format!(
                    "{}_{}_{}.deb",
                    sub.package, sub.version, job.architecture
                ));
                std::fs::write(&deb, job.architecture.as_bytes()).unwrap();
                BuildResult::new(ResultKind::Succeeded, "built")
                    .with_log(format!("{} {}: Status: successful\n", sub.package, job.architecture))
                    .with_artifacts(vec![deb])
            }
            Step::Fail => BuildResult::new(ResultKind::Failed, "dpkg-buildpackage failed")
                .with_log(format!("{} {}: Status: attempted\n", sub.package, job.architecture)),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Step::Panic => panic!("sbuild wrapper crashed"),
        }
    }
}

/// Counts session begins and ends
#[derive(Default)]
pub struct CountingSessions {
    pub begun: AtomicU64,
    pub ended: AtomicU64,
}

impl CountingSessions {
    pub fn open(&self) -> u64 {
        self.begun.load(Ordering::SeqCst) - self.ended.load(Ordering::SeqCst)
    }
}

impl SessionProvider for CountingSessions {
    fn begin(&self, chroot: &str) -> Result<String> {
        let n = self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-{}", chroot, n))
    }

    fn end(&self, _session: &str) -> Result<()> {
        self.ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Accepts every host command
#[derive(Default)]
pub struct QuietRunner;

impl CommandRunner for QuietRunner {
    fn run(&self, _argv: &[String]) -> Result<String> {
        Ok(String::new())
    }
}

/// A federation with nobody answering
pub struct NoPeers;

#[async_trait]
impl RemoteBuilder for NoPeers {
    async fn build(
        &self,
        peer: &PeerEndpoint,
        _submission: &Submission,
        _job: &JobSpec,
        _request_id: &str,
    ) -> BuildResult {
        BuildResult::new(ResultKind::NetworkError, format!("{} unreachable", peer.url))
    }

    async fn cancel(&self, _peer: &PeerEndpoint, _request_id: &str) -> Result<()> {
        Ok(())
    }

    async fn advertisement(&self, peer: &PeerEndpoint) -> Result<Advertisement> {
        Err(Error::Network(format!("{} unreachable", peer.url)))
    }
}

/// Configuration for instance `test`: sid (amd64, armel) with the default
/// layout, plus `extra` appended verbatim
pub fn config(base: &Path, extra: &str) -> Config {
    let base = base.display();
    Config::from_toml_str(&format!(
        r#"
[daemon]
identity = "test"
base_dir = "{base}"
schroot_conf_dir = "{base}/schroot"
use_sudo = false

[pool]
max_sessions_per_chroot = 1
acquire_timeout_secs = 2

[build]
job_timeout_secs = 1
capacity_retry_delay_ms = 10

[[distributions]]
codename = "sid"
base_version = "100"
architectures = ["amd64", "armel"]

[[chroots]]
codename = "sid"
architecture = "amd64"
backend = {{ type = "dir" }}

[[chroots]]
codename = "sid"
architecture = "armel"
backend = {{ type = "dir" }}

{extra}
"#
    ))
    .unwrap()
}

pub const DEFAULT_REPOSITORY: &str = r#"
[[repositories]]
identity = "test"
distributions = ["sid"]
"#;

pub struct Harness {
    pub temp: TempDir,
    pub daemon: Daemon,
    pub builder: Arc<FakeBuilder>,
    pub sessions: Arc<CountingSessions>,
}

impl Harness {
    /// A daemon with repository `test` and both sid chroots activated
    pub async fn new(extra: &str) -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("schroot")).unwrap();
        std::fs::create_dir_all(temp.path().join("work")).unwrap();

        let builder = Arc::new(FakeBuilder::new(&temp.path().join("work")));
        let sessions = Arc::new(CountingSessions::default());
        let services = Services {
            runner: Arc::new(QuietRunner),
            sessions: sessions.clone(),
            builder: builder.clone(),
            remote: Arc::new(NoPeers),
        };
        let store = Arc::new(Store::open(temp.path().join("autobuild.db")).unwrap());
        let daemon = Daemon::new(config(temp.path(), extra), store, services).unwrap();

        let harness = Self {
            temp,
            daemon,
            builder,
            sessions,
        };
        harness.bring_up(ResourceKind::Repository, "test").await;
        harness.bring_up(ResourceKind::Chroot, "mbd-sid-amd64").await;
        harness.bring_up(ResourceKind::Chroot, "mbd-sid-armel").await;
        harness
    }

    /// A second daemon over the same store and fakes, under `config`
    pub fn reopen(&self, config: Config) -> Daemon {
        let services = Services {
            runner: Arc::new(QuietRunner),
            sessions: self.sessions.clone(),
            builder: self.builder.clone(),
            remote: Arc::new(NoPeers),
        };
        let store = Arc::new(Store::open(self.temp.path().join("autobuild.db")).unwrap());
        Daemon::new(config, store, services).unwrap()
    }

    pub async fn bring_up(&self, kind: ResourceKind, key: &str) {
        let resource = ResourceRef::new(kind, key);
        for op in [Operation::Prepare, Operation::Check, Operation::Activate] {
            self.daemon.status_op(op, &resource).await.unwrap();
        }
    }
}

pub fn upload(package: &str, version: &str, dist: &str, archs: &[&str]) -> Submission {
    Submission::new(
        package,
        version,
        dist.parse().unwrap(),
        archs,
        PathBuf::from(format!("/incoming/{}_{}.dsc", package, version)),
    )
}
