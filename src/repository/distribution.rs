// src/repository/distribution.rs

//! Distribution strings and per-codename build policy
//!
//! A distribution string names one suite of one repository for one base
//! codename: `<codename>-<repoid>-<suite>[-rollback<n>]`, for example
//! `bookworm-test-unstable` or `bookworm-test-unstable-rollback2`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed distribution string
///
/// Serialized as its string form; the older field-by-field form is still
/// accepted when reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "DistributionRepr")]
pub struct DistributionString {
    pub codename: String,
    pub repository: String,
    pub suite: String,
    pub rollback: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DistributionRepr {
    Text(String),
    Parts {
        codename: String,
        repository: String,
        suite: String,
        #[serde(default)]
        rollback: Option<u32>,
    },
}

impl TryFrom<DistributionRepr> for DistributionString {
    type Error = Error;

    fn try_from(repr: DistributionRepr) -> Result<Self> {
        match repr {
            DistributionRepr::Text(text) => text.parse(),
            DistributionRepr::Parts {
                codename,
                repository,
                suite,
                rollback,
            } => {
                let mut dist = Self::new(&codename, &repository, &suite);
                dist.rollback = rollback;
                // round-trip so malformed parts are refused like malformed text
                dist.to_string().parse()
            }
        }
    }
}

impl From<DistributionString> for String {
    fn from(dist: DistributionString) -> Self {
        dist.to_string()
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

impl DistributionString {
    pub fn new(codename: &str, repository: &str, suite: &str) -> Self {
        Self {
            codename: codename.to_string(),
            repository: repository.to_string(),
            suite: suite.to_string(),
            rollback: None,
        }
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    /// The same distribution without a rollback suffix
    pub fn base(&self) -> DistributionString {
        Self {
            rollback: None,
            ..self.clone()
        }
    }

    pub fn with_rollback(&self, slot: u32) -> DistributionString {
        Self {
            rollback: Some(slot),
            ..self.clone()
        }
    }
}

impl FromStr for DistributionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || {
            Error::ParseError(format!(
                "malformed distribution '{}': expected <codename>-<repoid>-<suite>[-rollback<n>]",
                s
            ))
        };

        let parts: Vec<&str> = s.split('-').collect();
        let (codename, repository, suite, rollback) = match parts.as_slice() {
            [c, r, s] => (*c, *r, *s, None),
            [c, r, s, rb] => {
                let n = rb
                    .strip_prefix("rollback")
                    .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                    .ok_or_else(malformed)?;
                let n = n.parse::<u32>().map_err(|_| malformed())?;
                (*c, *r, *s, Some(n))
            }
            _ => return Err(malformed()),
        };

        if !(is_word(codename) && is_word(repository) && is_word(suite)) {
            return Err(malformed());
        }

        Ok(Self {
            codename: codename.to_string(),
            repository: repository.to_string(),
            suite: suite.to_string(),
            rollback,
        })
    }
}

impl fmt::Display for DistributionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.codename, self.repository, self.suite)?;
        if let Some(n) = self.rollback {
            write!(f, "-rollback{}", n)?;
        }
        Ok(())
    }
}

/// How lintian results affect a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LintianMode {
    /// Do not run lintian
    Disabled,
    /// Run, but never fail the build
    NeverFail,
    /// Fail on lintian errors
    #[default]
    FailOnError,
    /// Fail on lintian warnings
    FailOnWarning,
}

/// Build policy for one base codename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub codename: String,

    /// Numeric base version used in version suffixes (`110` for bookworm)
    pub base_version: String,

    pub architectures: Vec<String>,

    /// Architecture that builds arch-independent packages; defaults to the first
    #[serde(default)]
    pub arch_all_architecture: Option<String>,

    /// Let any one successful architecture build carry arch-independent packages
    #[serde(default)]
    pub arch_all_any: bool,

    #[serde(default)]
    pub lintian_mode: LintianMode,

    #[serde(default = "default_components")]
    pub components: Vec<String>,
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

impl Distribution {
    pub fn new(codename: &str, base_version: &str, architectures: &[&str]) -> Self {
        Self {
            codename: codename.to_string(),
            base_version: base_version.to_string(),
            architectures: architectures.iter().map(|a| a.to_string()).collect(),
            arch_all_architecture: None,
            arch_all_any: false,
            lintian_mode: LintianMode::default(),
            components: default_components(),
        }
    }

    /// Architecture designated for arch-independent packages
    pub fn arch_all(&self) -> Option<&str> {
        self.arch_all_architecture
            .as_deref()
            .or_else(|| self.architectures.first().map(String::as_str))
    }

    pub fn validate(&self) -> Result<()> {
        if self.architectures.is_empty() {
            return Err(Error::Config(format!(
                "distribution {}: no architectures",
                self.codename
            )));
        }
        if let Some(arch) = &self.arch_all_architecture
            && !self.architectures.contains(arch)
        {
            return Err(Error::Config(format!(
                "distribution {}: arch-all architecture {} is not built",
                self.codename, arch
            )));
        }
        if !self.base_version.chars().all(|c| c.is_ascii_digit()) || self.base_version.is_empty() {
            return Err(Error::Config(format!(
                "distribution {}: base version '{}' must be numeric",
                self.codename, self.base_version
            )));
        }
        Ok(())
    }
}
