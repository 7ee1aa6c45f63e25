// src/build/options.rs

//! Upload options attached to a submission
//!
//! Options arrive as free-form `key[alt]=value` items, where `alt` is
//! usually an architecture. Lookups try `key[alt]` first and fall back to
//! the plain `key`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const IGNORE_LINTIAN: &str = "ignore-lintian";
pub const RUN_LINTIAN: &str = "run-lintian";
pub const INTERNAL_APT_PRIORITY: &str = "internal-apt-priority";
pub const AUTO_PORTS: &str = "auto-ports";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Int,
    List,
}

fn kind_of(key: &str) -> Option<Kind> {
    match key {
        IGNORE_LINTIAN | RUN_LINTIAN => Some(Kind::Bool),
        INTERNAL_APT_PRIORITY => Some(Kind::Int),
        AUTO_PORTS => Some(Kind::List),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    List(Vec<String>),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct UploadOptions {
    values: BTreeMap<(String, Option<String>), OptionValue>,
}

/// Split `key[alt]` into its parts
fn split_key(raw: &str) -> Result<(String, Option<String>)> {
    match raw.split_once('[') {
        None => Ok((raw.to_string(), None)),
        Some((key, rest)) => {
            let alt = rest.strip_suffix(']').ok_or_else(|| {
                Error::ParseError(format!("upload option {}: unterminated '['", raw))
            })?;
            if alt.is_empty() || alt.contains(['[', ']']) {
                return Err(Error::ParseError(format!("upload option {}: bad qualifier", raw)));
            }
            Ok((key.to_string(), Some(alt.to_string())))
        }
    }
}

fn parse_value(key: &str, kind: Kind, raw: &str) -> Result<OptionValue> {
    match kind {
        Kind::Bool => match raw {
            "true" | "1" => Ok(OptionValue::Bool(true)),
            "false" | "0" => Ok(OptionValue::Bool(false)),
            _ => Err(Error::ParseError(format!(
                "upload option {}: {:?} is not a boolean",
                key, raw
            ))),
        },
        Kind::Int => raw.parse().map(OptionValue::Int).map_err(|_| {
            Error::ParseError(format!("upload option {}: {:?} is not an integer", key, raw))
        }),
        Kind::List => Ok(OptionValue::List(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )),
    }
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse option items; unknown or repeated keys are rejected
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let mut options = Self::default();
        for item in items {
            let item = item.as_ref().trim();
            if item.is_empty() {
                continue;
            }
            let (raw_key, raw_value) = item.split_once('=').ok_or_else(|| {
                Error::ParseError(format!("upload option {:?}: expected key=value", item))
            })?;
            let (key, alt) = split_key(raw_key.trim())?;
            let kind = kind_of(&key)
                .ok_or_else(|| Error::ParseError(format!("unknown upload option {}", key)))?;
            let value = parse_value(&key, kind, raw_value.trim())?;
            if options.values.insert((key, alt), value).is_some() {
                return Err(Error::ParseError(format!(
                    "upload option {} given more than once",
                    raw_key.trim()
                )));
            }
        }
        Ok(options)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `key[alt]` if set, else `key`
    pub fn get(&self, key: &str, alt: Option<&str>) -> Option<&OptionValue> {
        alt.and_then(|a| self.values.get(&(key.to_string(), Some(a.to_string()))))
            .or_else(|| self.values.get(&(key.to_string(), None)))
    }

    pub fn get_bool(&self, key: &str, alt: Option<&str>) -> Option<bool> {
        match self.get(key, alt) {
            Some(OptionValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn ignore_lintian(&self, arch: &str) -> bool {
        self.get_bool(IGNORE_LINTIAN, Some(arch)).unwrap_or(false)
    }

    pub fn run_lintian(&self, arch: &str) -> Option<bool> {
        self.get_bool(RUN_LINTIAN, Some(arch))
    }

    pub fn internal_apt_priority(&self) -> Option<i64> {
        match self.get(INTERNAL_APT_PRIORITY, None) {
            Some(OptionValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Distributions to port to after a successful install
    pub fn auto_ports(&self) -> Vec<String> {
        match self.get(AUTO_PORTS, None) {
            Some(OptionValue::List(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn to_items(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|((key, alt), value)| match alt {
                Some(alt) => format!("{}[{}]={}", key, alt, value),
                None => format!("{}={}", key, value),
            })
            .collect()
    }
}

impl TryFrom<Vec<String>> for UploadOptions {
    type Error = Error;

    fn try_from(items: Vec<String>) -> Result<Self> {
        Self::parse(&items)
    }
}

impl From<UploadOptions> for Vec<String> {
    fn from(options: UploadOptions) -> Self {
        options.to_items()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alt_overrides_plain_key() {
        let options =
            UploadOptions::parse(&["ignore-lintian=false", "ignore-lintian[armel]=1"]).unwrap();
        assert!(options.ignore_lintian("armel"));
        assert!(!options.ignore_lintian("amd64"));
        assert_eq!(options.run_lintian("amd64"), None);
    }

    #[test]
    fn test_typed_values() {
        let options = UploadOptions::parse(&[
            "internal-apt-priority=500",
            "auto-ports=bookworm-test-unstable, bullseye-test-unstable",
        ])
        .unwrap();
        assert_eq!(options.internal_apt_priority(), Some(500));
        assert_eq!(
            options.auto_ports(),
            vec!["bookworm-test-unstable", "bullseye-test-unstable"]
        );
    }

    #[test]
    fn test_rejections() {
        for bad in [
            vec!["no-such-option=1"],
            vec!["ignore-lintian=maybe"],
            vec!["internal-apt-priority=high"],
            vec!["ignore-lintian"],
            vec!["ignore-lintian[amd64=true"],
            vec!["run-lintian=1", "run-lintian=0"],
        ] {
            let result = UploadOptions::parse(&bad);
            assert!(matches!(result, Err(Error::ParseError(_))), "{:?} accepted", bad);
        }
        // same key with different qualifiers is fine
        assert!(UploadOptions::parse(&["run-lintian=1", "run-lintian[i386]=0"]).is_ok());
    }

    #[test]
    fn test_serde_as_item_list() {
        let options = UploadOptions::parse(&["ignore-lintian[armel]=true"]).unwrap();
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(json, r#"["ignore-lintian[armel]=true"]"#);
        let back: UploadOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
        assert!(serde_json::from_str::<UploadOptions>(r#"["bogus=1"]"#).is_err());
    }
}
