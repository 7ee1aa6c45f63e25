// src/build/builder.rs

//! Running one architecture's build inside a leased chroot session

use super::{BuildResult, JobSpec, ResultKind, Submission};
use crate::chroot::ChrootSession;
use crate::config::BuildSection;
use crate::repository::LintianMode;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// Builds one job in one session
///
/// Implementations never retry; every outcome, including failing to start,
/// is reported as a [`BuildResult`].
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, submission: &Submission, job: &JobSpec, session: &ChrootSession)
    -> BuildResult;
}

/// Summary fields sbuild prints at the end of a build log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SbuildSummary {
    pub status: Option<String>,
    pub lintian: Option<String>,
    pub fail_stage: Option<String>,
}

impl SbuildSummary {
    /// Later lines win, so the final summary block is what counts
    pub fn parse(log: &str) -> Self {
        let mut summary = Self::default();
        for line in log.lines() {
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match field.trim() {
                "Status" => summary.status = Some(value),
                "Lintian" => summary.lintian = Some(value),
                "Fail-Stage" => summary.fail_stage = Some(value),
                _ => {}
            }
        }
        summary
    }
}

/// Judge one build from its exit status, summary and QA policy
pub fn classify(
    exit_ok: bool,
    summary: &SbuildSummary,
    job: &JobSpec,
    ignore_lintian: bool,
) -> (ResultKind, String) {
    if summary.fail_stage.as_deref() == Some("create-session") {
        return (ResultKind::StartFailure, "could not create chroot session".into());
    }

    let status = summary.status.as_deref().unwrap_or("unknown");
    if !exit_ok || !matches!(status, "successful" | "skipped") {
        return (ResultKind::Failed, format!("sbuild status {}", status));
    }
    if status == "skipped" {
        return (ResultKind::Succeeded, "skipped".into());
    }

    // no Lintian line: lintian did not run
    let lintian = summary.lintian.as_deref().unwrap_or("pass");
    if lintian == "pass" {
        return (ResultKind::Succeeded, "successful".into());
    }
    let waiver = if job.experimental {
        Some("experimental suite")
    } else if job.lintian_mode < LintianMode::FailOnError {
        Some("lintian mode")
    } else if ignore_lintian {
        Some("ignore-lintian")
    } else {
        None
    };
    match waiver {
        Some(reason) => (
            ResultKind::Succeeded,
            format!("lintian {} (waived: {})", lintian, reason),
        ),
        None => (ResultKind::Failed, format!("lintian {}", lintian)),
    }
}

const ARTIFACT_EXTENSIONS: &[&str] = &["deb", "udeb", "ddeb", "changes", "buildinfo"];

/// sbuild-backed builder
#[derive(Debug, Clone)]
pub struct SbuildBuilder {
    command: Vec<String>,
    jobs: u32,
    work_dir: PathBuf,
    results_dir: PathBuf,
}

impl SbuildBuilder {
    pub fn new(config: &BuildSection, base_dir: &Path) -> Self {
        Self {
            command: config
                .sbuild_command
                .split_whitespace()
                .map(String::from)
                .collect(),
            jobs: config.sbuild_jobs.max(1),
            work_dir: base_dir.join("builds"),
            results_dir: base_dir.join("results"),
        }
    }

    pub fn command_line(
        &self,
        submission: &Submission,
        job: &JobSpec,
        session: &ChrootSession,
    ) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend([
            format!("--dist={}", submission.distribution.codename),
            format!("--arch={}", job.architecture),
            format!("--chroot={}", session.schroot_name()),
            "--nolog".to_string(),
        ]);
        if job.arch_all {
            argv.push("--arch-all".to_string());
        } else {
            argv.push("--no-arch-all".to_string());
        }
        let lintian = submission
            .options
            .run_lintian(&job.architecture)
            .unwrap_or(job.lintian_mode != LintianMode::Disabled);
        argv.push(if lintian { "--run-lintian" } else { "--no-run-lintian" }.to_string());
        argv.push(submission.dsc.display().to_string());
        argv
    }

    pub fn results_dir(&self, submission: &Submission, arch: &str) -> PathBuf {
        self.results_dir.join(submission.key()).join(arch)
    }

    fn collect_artifacts(&self, build_dir: &Path, target: &Path) -> std::io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(target)?;
        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(build_dir)? {
            let path = entry?.path();
            let wanted = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| ARTIFACT_EXTENSIONS.contains(&e));
            if !wanted || !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name() {
                let dest = target.join(name);
                std::fs::copy(&path, &dest)?;
                artifacts.push(dest);
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }
}

#[async_trait]
impl Builder for SbuildBuilder {
    async fn build(
        &self,
        submission: &Submission,
        job: &JobSpec,
        session: &ChrootSession,
    ) -> BuildResult {
        let arch = job.architecture.as_str();
        let build_dir = match std::fs::create_dir_all(&self.work_dir).and_then(|_| {
            tempfile::Builder::new()
                .prefix(&format!("{}-{}-", submission.key(), arch))
                .tempdir_in(&self.work_dir)
        }) {
            Ok(dir) => dir,
            Err(e) => {
                return BuildResult::new(
                    ResultKind::StartFailure,
                    format!("cannot create build directory: {}", e),
                );
            }
        };

        let argv = self.command_line(submission, job, session);
        let Some((program, args)) = argv.split_first() else {
            return BuildResult::new(ResultKind::StartFailure, "no sbuild command configured");
        };
        info!("[builder] {} on {}: {}", submission, arch, argv.join(" "));

        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(build_dir.path())
            .env("DEB_BUILD_OPTIONS", format!("parallel={}", self.jobs))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!("[builder] cannot run {}: {}", program, e);
                return BuildResult::new(
                    ResultKind::StartFailure,
                    format!("cannot run {}: {}", program, e),
                );
            }
        };

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        let summary = SbuildSummary::parse(&log);
        let (kind, detail) = classify(
            output.status.success(),
            &summary,
            job,
            submission.options.ignore_lintian(arch),
        );
        debug!("[builder] {} on {}: {} ({})", submission, arch, kind, detail);

        if kind != ResultKind::Succeeded {
            return BuildResult::new(kind, detail).with_log(log);
        }
        match self.collect_artifacts(build_dir.path(), &self.results_dir(submission, arch)) {
            Ok(artifacts) => BuildResult::new(kind, detail)
                .with_log(log)
                .with_artifacts(artifacts),
            Err(e) => BuildResult::new(
                ResultKind::Failed,
                format!("cannot collect build results: {}", e),
            )
            .with_log(log),
        }
    }
}
