// src/build/coordinator.rs

//! Fan-out of a submission's jobs over local sessions and peers
//!
//! Each job runs in its own task. A job prefers a local chroot session and
//! falls back to a peer chosen by the [`PeerRegistry`]. Every attempt is
//! bounded by the job timeout; retries follow [`DispatchPolicy`]:
//!
//! - a timed out job is retried once on a different worker (a fresh local
//!   session counts as one); with no alternative it ends `TimedOut`, and a
//!   retry that times out again ends `Failed`; a peer reporting its own
//!   timeout counts the same
//! - a builder that could not start gets a fresh session
//! - a network error marks the peer suspect and moves the job elsewhere
//! - a full peer or pool is retried elsewhere, or later after a delay
//!
//! Job state is written to the database after every transition so a restart
//! only re-dispatches jobs that had not finished.

use super::{BuildJob, BuildOutcome, BuildResult, Builder, JobSpec, JobState, ResultKind, Submission, Worker};
use crate::chroot::{ChrootKey, ChrootPool};
use crate::config::{BuildSection, PoolSection};
use crate::db::Store;
use crate::db::models::BuildJobRow;
use crate::error::{Error, Result};
use crate::federation::PeerRegistry;
use crate::federation::client::{PeerEndpoint, RemoteBuilder};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on the best-effort cancel request sent to a peer
const REMOTE_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts and retry bounds for dispatching jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub job_timeout: Duration,
    pub acquire_timeout: Duration,
    pub capacity_delay: Duration,
    pub timeout_retries: u32,
    pub start_retries: u32,
    pub capacity_retries: u32,
}

impl DispatchPolicy {
    pub fn from_config(build: &BuildSection, pool: &PoolSection) -> Self {
        Self {
            job_timeout: build.job_timeout(),
            acquire_timeout: pool.acquire_timeout(),
            capacity_delay: build.capacity_retry_delay(),
            timeout_retries: build.timeout_retries,
            start_retries: build.start_retries,
            capacity_retries: build.capacity_retries,
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&BuildSection::default(), &PoolSection::default())
    }
}

enum Target {
    Local,
    Remote(PeerEndpoint),
}

enum Attempt {
    Finished(BuildResult),
    TimedOut,
    Cancelled,
    /// The pool could not hand out a session
    NoSession(Error),
}

/// Everything a job task needs, shared by all of them
struct Shared {
    pool: ChrootPool,
    builder: Arc<dyn Builder>,
    peers: Arc<PeerRegistry>,
    remote: Arc<dyn RemoteBuilder>,
    store: Arc<Store>,
    policy: DispatchPolicy,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    running: DashMap<i64, CancellationToken>,
}

impl Coordinator {
    pub fn new(
        pool: ChrootPool,
        builder: Arc<dyn Builder>,
        peers: Arc<PeerRegistry>,
        remote: Arc<dyn RemoteBuilder>,
        store: Arc<Store>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                builder,
                peers,
                remote,
                store,
                policy,
            }),
            running: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.shared.policy
    }

    /// Submissions currently being built
    pub fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ask every job of a running submission to stop; false if none runs
    pub fn cancel(&self, submission_id: i64) -> bool {
        match self.running.get(&submission_id) {
            Some(token) => {
                info!("[coordinator] cancelling submission {}", submission_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Dispatch a fresh set of jobs and wait for all of them
    pub async fn run(
        &self,
        submission_id: i64,
        submission: &Submission,
        specs: Vec<JobSpec>,
    ) -> Result<BuildOutcome> {
        self.shared
            .store
            .with(|conn| BuildJobRow::clear_for_submission(conn, submission_id))?;
        let jobs: Vec<BuildJob> = specs.into_iter().map(BuildJob::new).collect();
        for job in &jobs {
            self.shared.persist(submission_id, job)?;
        }
        self.drive(submission_id, submission, jobs).await
    }

    /// Continue an interrupted submission
    ///
    /// Jobs whose stored state is terminal keep their result; everything else
    /// is dispatched again with its earlier log and attempt count.
    pub async fn resume(
        &self,
        submission_id: i64,
        submission: &Submission,
        specs: Vec<JobSpec>,
    ) -> Result<BuildOutcome> {
        let rows = self
            .shared
            .store
            .with(|conn| BuildJobRow::list_for_submission(conn, submission_id))?;

        let mut jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            let job = match rows.iter().find(|r| r.architecture == spec.architecture) {
                Some(row) => {
                    let mut job = BuildJob::restore(spec, row);
                    if !job.state.is_terminal() {
                        job.note("=== re-dispatched after restart ===");
                        self.shared.persist(submission_id, &job)?;
                    }
                    job
                }
                None => {
                    let job = BuildJob::new(spec);
                    self.shared.persist(submission_id, &job)?;
                    job
                }
            };
            jobs.push(job);
        }
        debug!(
            "[coordinator] resuming {}: {} of {} job(s) left",
            submission,
            jobs.iter().filter(|j| !j.state.is_terminal()).count(),
            jobs.len()
        );
        self.drive(submission_id, submission, jobs).await
    }

    async fn drive(
        &self,
        submission_id: i64,
        submission: &Submission,
        jobs: Vec<BuildJob>,
    ) -> Result<BuildOutcome> {
        let token = CancellationToken::new();
        self.running.insert(submission_id, token.clone());
        let submission = Arc::new(submission.clone());

        let mut finished: Vec<Option<BuildJob>> = Vec::with_capacity(jobs.len());
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            if job.state.is_terminal() {
                finished.push(Some(job));
                continue;
            }
            finished.push(None);
            let shared = Arc::clone(&self.shared);
            let submission = Arc::clone(&submission);
            let cancel = token.child_token();
            set.spawn(async move {
                (
                    index,
                    Shared::supervise(shared, submission_id, submission, job, cancel).await,
                )
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, job)) => finished[index] = Some(job),
                Err(e) => error!("[coordinator] job task for {} lost: {}", submission, e),
            }
        }
        self.running.remove(&submission_id);

        let unfinished = || Error::InvalidTransition(format!("{} left a job unfinished", submission));
        let jobs: Vec<BuildJob> = finished
            .into_iter()
            .map(|job| job.ok_or_else(unfinished))
            .collect::<Result<_>>()?;
        let outcome = BuildOutcome::aggregate(jobs, token.is_cancelled()).ok_or_else(unfinished)?;
        info!("[coordinator] {}: {}", submission, outcome.state);
        Ok(outcome)
    }
}

impl BuildJob {
    /// Rebuild a job from its stored row; unfinished states come back Pending
    pub fn restore(spec: JobSpec, row: &BuildJobRow) -> Self {
        let stored: JobState = row.state.parse().unwrap_or(JobState::Pending);
        let mut job = BuildJob::new(spec);
        job.attempts = u32::try_from(row.attempts).unwrap_or(0);
        job.log = row.log.clone();
        job.worker = row.worker.as_deref().and_then(Worker::parse);
        job.detail = row.detail.clone();
        if stored.is_terminal() {
            job.state = stored;
            job.artifacts = row.artifacts.iter().map(PathBuf::from).collect();
        }
        job
    }
}

impl Shared {
    /// Run one job in a nested task so a panicking builder still yields a
    /// terminal job
    async fn supervise(
        shared: Arc<Self>,
        submission_id: i64,
        submission: Arc<Submission>,
        job: BuildJob,
        cancel: CancellationToken,
    ) -> BuildJob {
        let fallback = job.clone();
        let runner = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            runner.run_job(submission_id, &submission, job, &cancel).await
        });
        match handle.await {
            Ok(job) => job,
            Err(e) => {
                let mut job = fallback;
                error!(
                    "[coordinator] job {} of submission {} crashed: {}",
                    job.architecture(),
                    submission_id,
                    e
                );
                job.state = JobState::Failed;
                job.note(&format!("=== builder crashed: {} ===", e));
                job.detail = Some("builder crashed".to_string());
                if let Err(e) = shared.persist(submission_id, &job) {
                    error!(
                        "[coordinator] crash of job {} of submission {} not recorded: {}",
                        job.architecture(),
                        submission_id,
                        e
                    );
                }
                job
            }
        }
    }

    async fn run_job(
        &self,
        submission_id: i64,
        submission: &Submission,
        mut job: BuildJob,
        cancel: &CancellationToken,
    ) -> BuildJob {
        let key = ChrootKey::new(&submission.distribution.codename, job.architecture());
        let owner = format!("{}@{}/{}", submission.key(), submission.distribution, key.architecture);
        // Peers unusable for this job, and peers that were merely full
        let mut avoid: Vec<String> = Vec::new();
        let mut busy: Vec<String> = Vec::new();
        let (mut timeouts, mut start_failures, mut waits) = (0u32, 0u32, 0u32);
        let mut unrecorded = false;

        loop {
            if cancel.is_cancelled() {
                job.state = JobState::Cancelled;
                break;
            }

            let excluded: Vec<String> = avoid.iter().chain(busy.iter()).cloned().collect();
            let target = if self.pool.is_hosted(&key.codename, &key.architecture) {
                Some(Target::Local)
            } else {
                self.peers.select(&key, &excluded).map(Target::Remote)
            };

            let Some(target) = target else {
                if !self.peers.hosts_except(&key, &avoid) {
                    job.state = JobState::Failed;
                    job.detail = Some(format!("no worker available for {}", key));
                    job.note(&format!("=== no worker available for {} ===", key));
                    break;
                }
                waits += 1;
                if waits > self.policy.capacity_retries {
                    job.state = JobState::Failed;
                    job.detail = Some(format!("no capacity for {} after {} wait(s)", key, waits - 1));
                    break;
                }
                debug!("[coordinator] no free worker for {}, waiting", key);
                if !self.pause(cancel).await {
                    job.state = JobState::Cancelled;
                    break;
                }
                busy.clear();
                continue;
            };

            job.state = JobState::Building;
            if let Err(e) = self.persist(submission_id, &job) {
                Self::fail_unrecorded(&mut job, submission_id, e);
                unrecorded = true;
                break;
            }

            let (worker, attempt) = match &target {
                Target::Local => self.build_local(submission, &job.spec, &owner, cancel).await,
                Target::Remote(peer) => (
                    Some(Worker::Remote {
                        peer: peer.id.clone(),
                    }),
                    self.build_remote(submission, &job.spec, peer, cancel).await,
                ),
            };
            let attempt = match attempt {
                Attempt::Finished(result) if result.kind == ResultKind::TimedOut => {
                    job.note(&format!("=== {} ===", result.detail));
                    Attempt::TimedOut
                }
                other => other,
            };

            match attempt {
                Attempt::Cancelled => {
                    self.pool.release_owned_by(&owner);
                    job.note("=== cancelled ===");
                    job.state = JobState::Cancelled;
                    break;
                }
                Attempt::NoSession(e) => {
                    waits += 1;
                    job.note(&format!("=== no chroot session: {} ===", e));
                    if waits > self.policy.capacity_retries {
                        job.state = JobState::Failed;
                        job.detail = Some(e.to_string());
                        break;
                    }
                    if matches!(e, Error::Capacity(_)) && !self.pause(cancel).await {
                        job.state = JobState::Cancelled;
                        break;
                    }
                }
                Attempt::TimedOut => {
                    timeouts += 1;
                    job.attempts += 1;
                    job.worker = worker.clone();
                    let on = worker.as_ref().map(|w| w.to_string()).unwrap_or_default();
                    job.note(&format!(
                        "=== attempt {} on {}: timed out after {}s ===",
                        job.attempts,
                        on,
                        self.policy.job_timeout.as_secs()
                    ));
                    if let Some(Worker::Remote { peer }) = &worker {
                        avoid.push(peer.clone());
                    }
                    if timeouts > self.policy.timeout_retries {
                        job.state = JobState::Failed;
                        job.detail = Some("timed out again on retry".to_string());
                        break;
                    }
                    let alternative = self.pool.is_hosted(&key.codename, &key.architecture)
                        || self.peers.hosts_except(&key, &avoid);
                    if !alternative {
                        job.state = JobState::TimedOut;
                        job.detail = Some("timed out, no other worker to retry on".to_string());
                        break;
                    }
                    warn!(
                        "[coordinator] {} ({}) timed out on {}, retrying elsewhere",
                        submission, key.architecture, on
                    );
                }
                Attempt::Finished(result) => {
                    let Some(worker) = worker else { continue };
                    job.record_attempt(&worker, &result);
                    let peer = match &worker {
                        Worker::Remote { peer } => Some(peer.clone()),
                        Worker::Local { .. } => None,
                    };
                    if let Some(peer) = &peer {
                        if result.kind == ResultKind::NetworkError {
                            self.peers.record_failure(peer);
                        } else {
                            self.peers.record_success(peer);
                        }
                    }

                    match result.kind {
                        ResultKind::Succeeded => {
                            job.artifacts = result.artifacts;
                            job.state = JobState::Succeeded;
                            break;
                        }
                        ResultKind::Failed | ResultKind::TimedOut => {
                            job.state = JobState::Failed;
                            break;
                        }
                        ResultKind::StartFailure => {
                            start_failures += 1;
                            if start_failures > self.policy.start_retries {
                                job.state = JobState::Failed;
                                break;
                            }
                            warn!(
                                "[coordinator] {} ({}) did not start on {}: {}",
                                submission, key.architecture, worker, result.detail
                            );
                        }
                        ResultKind::NetworkError | ResultKind::Refused => match peer {
                            Some(peer) => avoid.push(peer),
                            None => {
                                job.state = JobState::Failed;
                                break;
                            }
                        },
                        ResultKind::NoCapacity => match peer {
                            Some(peer) => busy.push(peer),
                            None => {
                                waits += 1;
                                if waits > self.policy.capacity_retries {
                                    job.state = JobState::Failed;
                                    break;
                                }
                                if !self.pause(cancel).await {
                                    job.state = JobState::Cancelled;
                                    break;
                                }
                            }
                        },
                    }
                }
            }
            if let Err(e) = self.persist(submission_id, &job) {
                Self::fail_unrecorded(&mut job, submission_id, e);
                unrecorded = true;
                break;
            }
        }

        if !unrecorded && let Err(e) = self.persist(submission_id, &job) {
            Self::fail_unrecorded(&mut job, submission_id, e);
        }
        debug!(
            "[coordinator] {} ({}) finished: {} after {} attempt(s)",
            submission, key.architecture, job.state, job.attempts
        );
        job
    }

    async fn build_local(
        &self,
        submission: &Submission,
        spec: &JobSpec,
        owner: &str,
        cancel: &CancellationToken,
    ) -> (Option<Worker>, Attempt) {
        let acquired = tokio::select! {
            _ = cancel.cancelled() => return (None, Attempt::Cancelled),
            acquired = self.pool.acquire(
                &submission.distribution.codename,
                &spec.architecture,
                self.policy.acquire_timeout,
                owner,
            ) => acquired,
        };
        let session = match acquired {
            Ok(session) => session,
            Err(e) => return (None, Attempt::NoSession(e)),
        };
        let worker = Worker::Local {
            session: session.schroot_name(),
        };

        let attempt = tokio::select! {
            _ = cancel.cancelled() => Attempt::Cancelled,
            built = tokio::time::timeout(
                self.policy.job_timeout,
                self.builder.build(submission, spec, &session),
            ) => match built {
                Ok(result) => Attempt::Finished(result),
                Err(_) => Attempt::TimedOut,
            },
        };
        self.pool.release(&session);
        (Some(worker), attempt)
    }

    async fn build_remote(
        &self,
        submission: &Submission,
        spec: &JobSpec,
        peer: &PeerEndpoint,
        cancel: &CancellationToken,
    ) -> Attempt {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.peers.begin(&peer.id);
        let (attempt, abandoned) = tokio::select! {
            _ = cancel.cancelled() => (Attempt::Cancelled, true),
            built = tokio::time::timeout(
                self.policy.job_timeout,
                self.remote.build(peer, submission, spec, &request_id),
            ) => match built {
                Ok(result) => (Attempt::Finished(result), false),
                Err(_) => (Attempt::TimedOut, true),
            },
        };
        self.peers.finish(&peer.id);

        if abandoned {
            match tokio::time::timeout(REMOTE_CANCEL_TIMEOUT, self.remote.cancel(peer, &request_id)).await {
                Ok(Ok(())) => debug!("[coordinator] cancelled {} on {}", request_id, peer.url),
                Ok(Err(e)) => debug!("[coordinator] cancel on {} failed: {}", peer.url, e),
                Err(_) => debug!("[coordinator] cancel on {} timed out", peer.url),
            }
        }
        attempt
    }

    /// Sleep the capacity delay; false if cancelled meanwhile
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.policy.capacity_delay) => true,
        }
    }

    /// A job whose state cannot be recorded stops as Failed
    fn fail_unrecorded(job: &mut BuildJob, submission_id: i64, e: Error) {
        error!(
            "[coordinator] cannot record job {} of submission {}: {}",
            job.architecture(),
            submission_id,
            e
        );
        job.state = JobState::Failed;
        job.detail = Some(format!("cannot record job state: {}", e));
        job.note(&format!("=== cannot record job state: {} ===", e));
    }

    fn persist(&self, submission_id: i64, job: &BuildJob) -> Result<()> {
        let mut row = BuildJobRow::new(
            submission_id,
            job.architecture().to_string(),
            job.state.to_string(),
        );
        row.worker = job.worker.as_ref().map(|w| w.to_string());
        row.attempts = i64::from(job.attempts);
        row.log = job.log.clone();
        row.artifacts = job
            .artifacts
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        row.detail = job.detail.clone();
        self.store.with(|conn| row.upsert(conn))?;
        Ok(())
    }
}
