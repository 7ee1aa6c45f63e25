// src/repository/layout.rs

//! Suite graphs shared by repositories
//!
//! A layout fixes the suites a repository offers, which ones accept
//! uploads, where each one migrates to, how deep its rollback ring is and
//! which version suffix it demands. Version restriction templates use
//! `{rid}` for the repository identity and `{nbv}` for the numeric base
//! version of the codename, so `~{rid}{nbv}\+[1-9]` becomes
//! `~test120\+[1-9]` for repository `test` on bookworm.

use super::distribution::DistributionString;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One stage of a promotion graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    pub name: String,

    #[serde(default)]
    pub uploadable: bool,

    #[serde(default)]
    pub experimental: bool,

    /// Rollback ring depth
    #[serde(default = "default_rollback")]
    pub rollback: usize,

    #[serde(default)]
    pub migrates_to: Option<String>,

    /// Migrate without confirmation after the quiescence period
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_quiescence_days")]
    pub quiescence_days: i64,

    /// Overrides the layout-wide restriction template
    #[serde(default)]
    pub version_restriction: Option<String>,

    /// Overrides the layout-wide default suffix template
    #[serde(default)]
    pub default_version: Option<String>,
}

fn default_rollback() -> usize {
    6
}

fn default_quiescence_days() -> i64 {
    7
}

impl Suite {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uploadable: false,
            experimental: false,
            rollback: default_rollback(),
            migrates_to: None,
            auto_migrate: false,
            quiescence_days: default_quiescence_days(),
            version_restriction: None,
            default_version: None,
        }
    }

    pub fn uploadable(mut self) -> Self {
        self.uploadable = true;
        self
    }

    pub fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    pub fn rollback(mut self, depth: usize) -> Self {
        self.rollback = depth;
        self
    }

    pub fn migrates_to(mut self, target: &str) -> Self {
        self.migrates_to = Some(target.to_string());
        self
    }
}

/// A fixed suite graph with its version rules and meta-distribution aliases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,

    pub suites: Vec<Suite>,

    /// Alias → `<codename>-<suite>`
    #[serde(default)]
    pub meta_distributions: BTreeMap<String, String>,

    #[serde(default = "default_restriction")]
    pub version_restriction: String,

    #[serde(default = "default_experimental_restriction")]
    pub experimental_version_restriction: String,

    #[serde(default = "default_version")]
    pub default_version: String,

    #[serde(default = "default_experimental_version")]
    pub experimental_default_version: String,
}

fn default_restriction() -> String {
    r"~{rid}{nbv}\+[1-9]".to_string()
}

fn default_experimental_restriction() -> String {
    r"~{rid}{nbv}\+0".to_string()
}

fn default_version() -> String {
    "~{rid}{nbv}+1".to_string()
}

fn default_experimental_version() -> String {
    "~{rid}{nbv}+0".to_string()
}

fn expand(template: &str, rid: &str, nbv: &str) -> String {
    template.replace("{rid}", rid).replace("{nbv}", nbv)
}

impl Layout {
    /// The conventional stable/hotfix/testing/unstable/snapshot/experimental graph
    pub fn default_layout() -> Self {
        let mut meta_distributions = BTreeMap::new();
        meta_distributions.insert("unstable".to_string(), "sid-unstable".to_string());
        meta_distributions.insert("experimental".to_string(), "sid-experimental".to_string());

        Self {
            name: "Default".to_string(),
            suites: vec![
                Suite::new("stable").rollback(6),
                Suite::new("hotfix").uploadable().migrates_to("stable").rollback(4),
                Suite::new("testing").migrates_to("stable").rollback(3),
                Suite::new("unstable").uploadable().migrates_to("testing").rollback(9),
                Suite::new("snapshot").uploadable().experimental().rollback(12),
                Suite::new("experimental").uploadable().experimental().rollback(6),
            ],
            meta_distributions,
            version_restriction: default_restriction(),
            experimental_version_restriction: default_experimental_restriction(),
            default_version: default_version(),
            experimental_default_version: default_experimental_version(),
        }
    }

    pub fn suite(&self, name: &str) -> Option<&Suite> {
        self.suites.iter().find(|s| s.name == name)
    }

    pub fn require_suite(&self, name: &str) -> Result<&Suite> {
        self.suite(name).ok_or_else(|| {
            Error::NotFound(format!("suite '{}' in layout {}", name, self.name))
        })
    }

    fn restriction_template<'a>(&'a self, suite: &'a Suite) -> &'a str {
        match &suite.version_restriction {
            Some(t) => t,
            None if suite.experimental => &self.experimental_version_restriction,
            None => &self.version_restriction,
        }
    }

    /// Compiled version restriction of a suite for one repository and codename
    pub fn version_restriction(&self, suite: &Suite, rid: &str, nbv: &str) -> Result<Regex> {
        let pattern = expand(
            self.restriction_template(suite),
            &regex::escape(rid),
            &regex::escape(nbv),
        );
        Regex::new(&pattern).map_err(|e| {
            Error::Config(format!(
                "layout {} suite {}: invalid version restriction '{}': {}",
                self.name, suite.name, pattern, e
            ))
        })
    }

    /// Default version suffix a suite expects, e.g. `~test120+1`
    pub fn default_version(&self, suite: &Suite, rid: &str, nbv: &str) -> String {
        let template = match &suite.default_version {
            Some(t) => t,
            None if suite.experimental => &self.experimental_default_version,
            None => &self.default_version,
        };
        expand(template, rid, nbv)
    }

    /// Canonical target of a meta-distribution alias for one repository
    pub fn resolve_meta(&self, alias: &str, rid: &str) -> Option<DistributionString> {
        let target = self.meta_distributions.get(alias)?;
        let (codename, suite) = target.split_once('-')?;
        Some(DistributionString::new(codename, rid, suite))
    }

    /// Structural checks: unique suites, known and acyclic migration
    /// targets, compilable restriction templates, well-formed aliases
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for suite in &self.suites {
            if !seen.insert(suite.name.as_str()) {
                return Err(Error::Config(format!(
                    "layout {}: duplicate suite {}",
                    self.name, suite.name
                )));
            }
        }

        let targets: HashMap<&str, Option<&str>> = self
            .suites
            .iter()
            .map(|s| (s.name.as_str(), s.migrates_to.as_deref()))
            .collect();

        for suite in &self.suites {
            if let Some(target) = &suite.migrates_to
                && !targets.contains_key(target.as_str())
            {
                return Err(Error::Config(format!(
                    "layout {}: suite {} migrates to unknown suite {}",
                    self.name, suite.name, target
                )));
            }

            // walk the chain; a linear graph of n suites has at most n hops
            let mut hops = 0;
            let mut current = suite.migrates_to.as_deref();
            while let Some(next) = current {
                hops += 1;
                if next == suite.name || hops > self.suites.len() {
                    return Err(Error::Config(format!(
                        "layout {}: migration cycle through suite {}",
                        self.name, suite.name
                    )));
                }
                current = targets.get(next).copied().flatten();
            }

            if suite.auto_migrate && suite.migrates_to.is_none() {
                return Err(Error::Config(format!(
                    "layout {}: suite {} migrates automatically but has no target",
                    self.name, suite.name
                )));
            }

            self.version_restriction(suite, "rid", "100")?;
        }

        for (alias, target) in &self.meta_distributions {
            let suite = target.split_once('-').map(|(_, s)| s);
            match suite {
                Some(s) if self.suite(s).is_some() => {}
                _ => {
                    return Err(Error::Config(format!(
                        "layout {}: meta-distribution {} has invalid target '{}'",
                        self.name, alias, target
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Reject alias sets where one alias maps to two different canonical
/// distributions across the layouts in use
///
/// `in_use` pairs each active repository identity with its layout.
pub fn check_meta_ambiguity(in_use: &[(&str, &Layout)]) -> Result<()> {
    let mut mapped: HashMap<&str, (String, &str)> = HashMap::new();

    for (rid, layout) in in_use {
        for alias in layout.meta_distributions.keys() {
            let Some(target) = layout.resolve_meta(alias, rid) else {
                continue;
            };
            let target = target.to_string();
            match mapped.get(alias.as_str()) {
                Some((existing, owner)) if *existing != target => {
                    return Err(Error::Config(format!(
                        "meta-distribution '{}' is ambiguous: {} (repository {}) vs {} (repository {})",
                        alias, existing, owner, target, rid
                    )));
                }
                Some(_) => {}
                None => {
                    mapped.insert(alias.as_str(), (target, *rid));
                }
            }
        }
    }
    Ok(())
}

/// Resolve an upload distribution: a full distribution string, or a
/// meta-distribution alias that must map to exactly one target over
/// `candidates` (repository identity, layout, codenames served)
pub fn resolve_distribution(
    name: &str,
    candidates: &[(&str, &Layout, &[String])],
) -> Result<DistributionString> {
    if let Ok(dist) = name.parse::<DistributionString>() {
        return Ok(dist);
    }

    let mut targets: Vec<DistributionString> = Vec::new();
    for (rid, layout, codenames) in candidates {
        if let Some(target) = layout.resolve_meta(name, rid)
            && codenames.contains(&target.codename)
            && !targets.contains(&target)
        {
            targets.push(target);
        }
    }
    match targets.len() {
        0 => Err(Error::Rejected(format!(
            "'{}' is neither a distribution nor a meta-distribution",
            name
        ))),
        1 => Ok(targets.remove(0)),
        _ => Err(Error::Rejected(format!(
            "meta-distribution '{}' is ambiguous: {}",
            name,
            targets.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        let layout = Layout::default_layout();
        layout.validate().unwrap();

        let unstable = layout.suite("unstable").unwrap();
        assert!(unstable.uploadable);
        assert_eq!(unstable.migrates_to.as_deref(), Some("testing"));
        assert!(!layout.suite("testing").unwrap().uploadable);
        assert_eq!(layout.suite("snapshot").unwrap().rollback, 12);
    }

    #[test]
    fn test_version_restriction_expansion() {
        let layout = Layout::default_layout();
        let unstable = layout.suite("unstable").unwrap();
        let re = layout.version_restriction(unstable, "test", "120").unwrap();
        assert!(re.is_match("1.0-1~test120+1"));
        assert!(!re.is_match("1.0-1~test120+0"));
        assert!(!re.is_match("1.0-1"));

        let exp = layout.suite("experimental").unwrap();
        let re = layout.version_restriction(exp, "test", "120").unwrap();
        assert!(re.is_match("1.0-1~test120+0"));
        assert_eq!(layout.default_version(exp, "test", "120"), "~test120+0");
        assert_eq!(layout.default_version(unstable, "test", "120"), "~test120+1");
    }

    #[test]
    fn test_validate_rejects_cycles_and_bad_patterns() {
        let mut layout = Layout::default_layout();
        layout.suites[0].migrates_to = Some("unstable".into());
        assert!(matches!(layout.validate(), Err(Error::Config(_))));

        let mut layout = Layout::default_layout();
        layout.suites[1].version_restriction = Some("~{rid}(".into());
        assert!(matches!(layout.validate(), Err(Error::Config(_))));

        let mut layout = Layout::default_layout();
        layout.suites[1].migrates_to = Some("nowhere".into());
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_resolve_meta() {
        let layout = Layout::default_layout();
        let d = layout.resolve_meta("unstable", "test").unwrap();
        assert_eq!(d.to_string(), "sid-test-unstable");
        assert!(layout.resolve_meta("stable", "test").is_none());
    }

    #[test]
    fn test_meta_ambiguity_across_layouts() {
        let default = Layout::default_layout();
        let mut other = Layout::default_layout();
        other.name = "Other".into();
        other.meta_distributions.clear();
        other
            .meta_distributions
            .insert("unstable".into(), "bookworm-unstable".into());

        // one repository, one mapping
        check_meta_ambiguity(&[("test", &default)]).unwrap();
        // different layouts mapping the same alias elsewhere
        assert!(matches!(
            check_meta_ambiguity(&[("test", &default), ("prod", &other)]),
            Err(Error::Config(_))
        ));
        // layouts without aliases never conflict
        other.meta_distributions.clear();
        check_meta_ambiguity(&[("test", &default), ("prod", &other)]).unwrap();
    }

    #[test]
    fn test_resolve_distribution() {
        let default = Layout::default_layout();
        let sid = vec!["sid".to_string()];
        let bookworm = vec!["bookworm".to_string()];

        let only_test = [("test", &default, sid.as_slice())];
        assert_eq!(
            resolve_distribution("unstable", &only_test).unwrap().to_string(),
            "sid-test-unstable"
        );
        assert_eq!(
            resolve_distribution("bookworm-test-stable", &only_test).unwrap().to_string(),
            "bookworm-test-stable"
        );
        assert!(matches!(resolve_distribution("stable", &only_test), Err(Error::Rejected(_))));

        // a repository not serving the target codename does not compete
        let with_prod = [("test", &default, sid.as_slice()), ("prod", &default, bookworm.as_slice())];
        assert_eq!(
            resolve_distribution("unstable", &with_prod).unwrap().to_string(),
            "sid-test-unstable"
        );

        let both = [("test", &default, sid.as_slice()), ("prod", &default, sid.as_slice())];
        assert!(matches!(resolve_distribution("unstable", &both), Err(Error::Rejected(_))));
    }
}
