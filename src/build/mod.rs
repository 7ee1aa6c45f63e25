// src/build/mod.rs

//! Submissions, per-architecture build jobs and their aggregated outcome
//!
//! A [`Submission`] is fanned out into one [`BuildJob`] per required
//! architecture by the [`Coordinator`]. Jobs run on a local [`Builder`]
//! inside a leased chroot session or on a remote peer, and are folded into
//! a single [`BuildOutcome`] once every job is terminal.

pub mod builder;
pub mod coordinator;
pub mod options;

pub use builder::{Builder, SbuildBuilder, SbuildSummary};
pub use coordinator::Coordinator;
pub use options::UploadOptions;

use crate::repository::{Distribution, DistributionString, LintianMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

/// A parsed, authenticated build request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub package: String,
    pub version: String,
    pub distribution: DistributionString,
    #[serde(default = "default_component")]
    pub component: String,
    /// Architectures from the source package: concrete names, `any`, `all`
    pub architectures: Vec<String>,
    /// Path of the source package's .dsc in the spool
    pub dsc: PathBuf,
    #[serde(default)]
    pub options: UploadOptions,
}

fn default_component() -> String {
    "main".to_string()
}

impl Submission {
    pub fn new(
        package: &str,
        version: &str,
        distribution: DistributionString,
        architectures: &[&str],
        dsc: PathBuf,
    ) -> Self {
        Self {
            package: package.to_string(),
            version: version.to_string(),
            distribution,
            component: default_component(),
            architectures: architectures.iter().map(|a| a.to_string()).collect(),
            dsc,
            options: UploadOptions::default(),
        }
    }

    /// `<package>_<version>`, as used in file names
    pub fn key(&self) -> String {
        format!("{}_{}", self.package, self.version)
    }

    /// Architecture-dependent architectures requested, resolved against `dist`
    pub fn concrete_architectures(&self, dist: &Distribution) -> Vec<String> {
        let mut archs: Vec<String> = Vec::new();
        for arch in &self.architectures {
            match arch.as_str() {
                "all" => {}
                "any" => {
                    for a in &dist.architectures {
                        if !archs.contains(a) {
                            archs.push(a.clone());
                        }
                    }
                }
                a => {
                    if dist.architectures.iter().any(|d| d == a) && !archs.iter().any(|x| x == a) {
                        archs.push(a.to_string());
                    }
                }
            }
        }
        archs
    }

    pub fn has_arch_all(&self) -> bool {
        self.architectures.iter().any(|a| a == "all")
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.package, self.version, self.distribution)
    }
}

/// What one job must build, and the QA policy it is judged by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub architecture: String,
    /// Also build architecture-independent packages
    pub arch_all: bool,
    /// Optional jobs belong to an any-one-suffices arch-all group
    pub required: bool,
    pub lintian_mode: LintianMode,
    pub experimental: bool,
}

impl JobSpec {
    pub fn new(architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            arch_all: false,
            required: true,
            lintian_mode: LintianMode::default(),
            experimental: false,
        }
    }
}

/// Work out the jobs a submission needs on `dist`
///
/// Every concrete architecture is required; the designated arch-all
/// architecture (or the first concrete one) also builds `all` packages.
/// A submission that only has `all` packages builds on the designated
/// architecture, or on every architecture with any one success sufficing
/// when the distribution allows it.
pub fn plan_jobs(submission: &Submission, dist: &Distribution, experimental: bool) -> Vec<JobSpec> {
    let spec = |arch: &str, arch_all: bool, required: bool| JobSpec {
        architecture: arch.to_string(),
        arch_all,
        required,
        lintian_mode: dist.lintian_mode,
        experimental,
    };

    let concrete = submission.concrete_architectures(dist);
    if !concrete.is_empty() {
        let designated = dist
            .arch_all()
            .filter(|a| concrete.iter().any(|c| c == a))
            .map(String::from)
            .unwrap_or_else(|| concrete[0].clone());
        return concrete
            .iter()
            .map(|arch| spec(arch, submission.has_arch_all() && *arch == designated, true))
            .collect();
    }

    if !submission.has_arch_all() {
        return Vec::new();
    }
    if dist.arch_all_any {
        dist.architectures.iter().map(|arch| spec(arch, true, false)).collect()
    } else {
        dist.arch_all()
            .map(|arch| vec![spec(arch, true, true)])
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResultKind {
    Succeeded,
    /// Build ran and failed, or QA rejected it
    Failed,
    /// The build could not start (unusable session)
    StartFailure,
    /// Peer unreachable or authentication failed
    NetworkError,
    /// Peer (or backend) has no free slot right now
    NoCapacity,
    /// Peer declined the build
    Refused,
    /// Build outlived the job timeout on the peer
    TimedOut,
}

/// What a builder reports for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub kind: ResultKind,
    pub log: String,
    pub artifacts: Vec<PathBuf>,
    pub detail: String,
}

impl BuildResult {
    pub fn new(kind: ResultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            log: String::new(),
            artifacts: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.kind == ResultKind::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Building,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Building)
    }
}

/// Where a job ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Worker {
    Local { session: String },
    Remote { peer: String },
}

impl Worker {
    /// Inverse of `Display`, for job rows read back from the database
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(session) = text.strip_prefix("local:") {
            Some(Worker::Local {
                session: session.to_string(),
            })
        } else {
            text.strip_prefix("peer:").map(|peer| Worker::Remote {
                peer: peer.to_string(),
            })
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Worker::Local { session } => write!(f, "local:{}", session),
            Worker::Remote { peer } => write!(f, "peer:{}", peer),
        }
    }
}

/// One architecture's build for one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub spec: JobSpec,
    pub state: JobState,
    pub worker: Option<Worker>,
    pub attempts: u32,
    /// Logs of all attempts, oldest first
    pub log: String,
    pub artifacts: Vec<PathBuf>,
    pub detail: Option<String>,
}

impl BuildJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            state: JobState::Pending,
            worker: None,
            attempts: 0,
            log: String::new(),
            artifacts: Vec::new(),
            detail: None,
        }
    }

    pub fn architecture(&self) -> &str {
        &self.spec.architecture
    }

    /// Append one attempt's log under a header naming the worker
    pub fn record_attempt(&mut self, worker: &Worker, result: &BuildResult) {
        self.attempts += 1;
        self.worker = Some(worker.clone());
        self.log.push_str(&format!(
            "=== attempt {} on {}: {} ===\n",
            self.attempts, worker, result.kind
        ));
        self.log.push_str(&result.log);
        if !self.log.ends_with('\n') {
            self.log.push('\n');
        }
        self.detail = Some(result.detail.clone());
    }

    pub fn note(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeState {
    AllSucceeded,
    PartialFailure,
    AllFailed,
    Cancelled,
}

/// Per-architecture entry of a failure report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchReport {
    pub state: JobState,
    pub attempts: u32,
    pub worker: Option<String>,
    pub detail: Option<String>,
    pub log: String,
}

/// Retained per-architecture logs of a submission that did not install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub package: String,
    pub version: String,
    pub distribution: String,
    pub outcome: OutcomeState,
    pub architectures: BTreeMap<String, ArchReport>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({}): {}",
            self.package, self.version, self.distribution, self.outcome
        )?;
        for (arch, report) in &self.architectures {
            writeln!(
                f,
                "\n--- {}: {} after {} attempt(s){} ---",
                arch,
                report.state,
                report.attempts,
                report
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            )?;
            write!(f, "{}", report.log)?;
        }
        Ok(())
    }
}

/// The aggregate of all jobs of one submission, built only from terminal jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub state: OutcomeState,
    pub jobs: Vec<BuildJob>,
}

impl BuildOutcome {
    /// Fold terminal jobs; `None` while any job is still pending or building
    pub fn aggregate(jobs: Vec<BuildJob>, cancelled: bool) -> Option<Self> {
        if jobs.iter().any(|j| !j.state.is_terminal()) {
            return None;
        }
        let succeeded = |j: &BuildJob| j.state == JobState::Succeeded;
        let state = if cancelled {
            OutcomeState::Cancelled
        } else if !jobs.is_empty() && Self::installable_jobs(&jobs) {
            OutcomeState::AllSucceeded
        } else if jobs.iter().any(succeeded) {
            OutcomeState::PartialFailure
        } else {
            OutcomeState::AllFailed
        };
        Some(Self { state, jobs })
    }

    fn installable_jobs(jobs: &[BuildJob]) -> bool {
        let required_ok = jobs
            .iter()
            .filter(|j| j.spec.required)
            .all(|j| j.state == JobState::Succeeded);
        let has_optional = jobs.iter().any(|j| !j.spec.required);
        let optional_ok = !has_optional
            || jobs
                .iter()
                .any(|j| !j.spec.required && j.state == JobState::Succeeded);
        required_ok && optional_ok
    }

    pub fn is_installable(&self) -> bool {
        self.state == OutcomeState::AllSucceeded
    }

    /// Artifacts to install: every required job, plus one optional success
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut artifacts: Vec<PathBuf> = self
            .jobs
            .iter()
            .filter(|j| j.spec.required && j.state == JobState::Succeeded)
            .flat_map(|j| j.artifacts.iter().cloned())
            .collect();
        if let Some(optional) = self
            .jobs
            .iter()
            .find(|j| !j.spec.required && j.state == JobState::Succeeded)
        {
            artifacts.extend(optional.artifacts.iter().cloned());
        }
        artifacts
    }

    pub fn failure_report(&self, submission: &Submission) -> FailureReport {
        FailureReport {
            package: submission.package.clone(),
            version: submission.version.clone(),
            distribution: submission.distribution.to_string(),
            outcome: self.state,
            architectures: self
                .jobs
                .iter()
                .map(|j| {
                    (
                        j.spec.architecture.clone(),
                        ArchReport {
                            state: j.state,
                            attempts: j.attempts,
                            worker: j.worker.as_ref().map(|w| w.to_string()),
                            detail: j.detail.clone(),
                            log: j.log.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}
