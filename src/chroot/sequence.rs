// src/chroot/sequence.rs

//! External command execution with per-step rollback

use crate::error::{Error, Result};
use std::process::Command;
use tracing::{debug, error, warn};

/// Runs one external command and returns its stdout
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String]) -> Result<String>;
}

/// Runs commands on the host, optionally through sudo
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    pub use_sudo: bool,
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::IoError("empty command".to_string()))?;

        let mut cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            Command::new(program)
        };
        cmd.args(args);

        debug!("[call] {}", argv.join(" "));
        let output = cmd
            .output()
            .map_err(|e| Error::IoError(format!("failed to run {}: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::IoError(format!(
                "{} failed ({}): {}",
                argv.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// A command and the command undoing it; either may be empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub run: Vec<String>,
    pub rollback: Vec<String>,
}

/// Ordered steps where a failure undoes everything done so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSequence {
    steps: Vec<Step>,
}

pub(crate) fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl CallSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, run: Vec<String>, rollback: Vec<String>) {
        self.steps.push(Step { run, rollback });
    }

    pub fn extend(&mut self, other: CallSequence) {
        self.steps.extend(other.steps);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run all steps; on failure at step `i`, roll back steps `i..=0`
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.run.is_empty() {
                continue;
            }
            if let Err(e) = runner.run(&step.run) {
                error!("[call] sequence failed at step {} (rolling back): {}", i, e);
                self.rollback_from(i, runner);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run every rollback command, last step first
    pub fn rollback_all(&self, runner: &dyn CommandRunner) {
        if let Some(last) = self.steps.len().checked_sub(1) {
            self.rollback_from(last, runner);
        }
    }

    fn rollback_from(&self, pos: usize, runner: &dyn CommandRunner) {
        for step in self.steps[..=pos].iter().rev() {
            if step.rollback.is_empty() {
                continue;
            }
            if let Err(e) = runner.run(&step.rollback) {
                warn!("[call] rollback step failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every command; fails the ones whose first words match
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub fail_on: Mutex<Vec<Vec<String>>>,
        pub output: Mutex<String>,
    }

    impl RecordingRunner {
        pub fn fail_when(&self, prefix: &[&str]) {
            self.fail_on.lock().push(argv(prefix));
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.join(" ")).collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, argv: &[String]) -> Result<String> {
            self.calls.lock().push(argv.to_vec());
            let failing = self
                .fail_on
                .lock()
                .iter()
                .any(|prefix| argv.starts_with(prefix));
            if failing {
                Err(Error::IoError(format!("{} failed", argv.join(" "))))
            } else {
                Ok(self.output.lock().clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    fn sequence() -> CallSequence {
        let mut seq = CallSequence::new();
        seq.push(argv(&["mkdir", "a"]), argv(&["rmdir", "a"]));
        seq.push(argv(&["mount", "a"]), argv(&["umount", "a"]));
        seq.push(argv(&["touch", "a/x"]), Vec::new());
        seq
    }

    #[test]
    fn test_run_all_steps() {
        let runner = RecordingRunner::default();
        sequence().run(&runner).unwrap();
        assert_eq!(runner.commands(), vec!["mkdir a", "mount a", "touch a/x"]);
    }

    #[test]
    fn test_failure_rolls_back_in_reverse() {
        let runner = RecordingRunner::default();
        runner.fail_when(&["touch"]);
        assert!(sequence().run(&runner).is_err());
        assert_eq!(
            runner.commands(),
            vec!["mkdir a", "mount a", "touch a/x", "umount a", "rmdir a"]
        );
    }

    #[test]
    fn test_rollback_all_continues_past_failures() {
        let runner = RecordingRunner::default();
        runner.fail_when(&["umount"]);
        sequence().rollback_all(&runner);
        assert_eq!(runner.commands(), vec!["umount a", "rmdir a"]);
    }
}
