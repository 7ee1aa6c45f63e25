// src/repository/version.rs

//! Debian version parsing, ordering and the version rewrites used by
//! rebuilds and ports
//!
//! Ordering follows dpkg: epoch first, then upstream version, then
//! revision, each compared with alternating non-digit/digit runs where
//! `~` sorts before everything, even the end of the string.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::{Match, Regex};
use std::cmp::Ordering;
use std::fmt;

/// A parsed Debian version: `[epoch:]upstream[-revision]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebianVersion {
    pub epoch: u64,
    pub upstream: String,
    pub revision: Option<String>,
}

impl DebianVersion {
    /// Parse a Debian version string
    ///
    /// - "1.2.3" → epoch=0, upstream="1.2.3", revision=None
    /// - "2:1.2.3-1~test120+1" → epoch=2, upstream="1.2.3", revision="1~test120+1"
    /// - "1.0-2-3" → upstream="1.0-2", revision="3" (the last hyphen splits)
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (epoch, rest) = match s.split_once(':') {
            Some((e, r)) => {
                let epoch = e.parse::<u64>().map_err(|e| {
                    Error::ParseError(format!("invalid epoch in version '{}': {}", s, e))
                })?;
                (epoch, r)
            }
            None => (0, s),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((u, r)) => (u, Some(r.to_string())),
            None => (rest, None),
        };

        if upstream.is_empty() || !upstream.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::ParseError(format!(
                "upstream version in '{}' must start with a digit",
                s
            )));
        }
        if revision.as_deref() == Some("") {
            return Err(Error::ParseError(format!("empty revision in '{}'", s)));
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision,
        })
    }

    pub fn compare(&self, other: &DebianVersion) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| verrevcmp(&self.upstream, &other.upstream))
            .then_with(|| {
                verrevcmp(
                    self.revision.as_deref().unwrap_or("0"),
                    other.revision.as_deref().unwrap_or("0"),
                )
            })
    }

    /// Rebuild version: append `+rebuilt<stamp>`, replacing an earlier rebuild stamp
    ///
    /// `1.2.3` → `1.2.3+rebuilt20260215100453`
    pub fn internal_rebuild(&self, now: DateTime<Utc>) -> String {
        let stamp = now.format("%Y%m%d%H%M%S").to_string();
        let pattern = Regex::new(r"\+rebuilt[0-9]{14}").ok();
        let full = self.to_string();
        match pattern {
            Some(re) => sub_rightmost(&re, &format!("+rebuilt{}", stamp), &full),
            None => format!("{}+rebuilt{}", full, stamp),
        }
    }

    /// External port version: append the target suite's default suffix
    pub fn external_port(&self, default_suffix: &str) -> String {
        format!("{}{}", self, default_suffix)
    }

    /// Internal port version between two suites of the same layout
    ///
    /// The rightmost match of the source suite's restriction is replaced by
    /// the target's default suffix, keeping the source's `+N` counter:
    /// `1.2.3-1~testSID+4fud15` with `~testSID\+[1-9]` → `~test70+1` gives
    /// `1.2.3-1~test70+4fud15`.
    pub fn internal_port(&self, from_restriction: &Regex, to_default: &str) -> Result<String> {
        let counter = Regex::new(r"\+[0-9]")?;
        let full = self.to_string();

        let appendix = rightmost(from_restriction, &full)
            .map(|m| m.as_str())
            .unwrap_or("");
        let target = match rightmost(&counter, appendix) {
            Some(m) if !appendix.is_empty() => sub_rightmost(&counter, m.as_str(), to_default),
            _ => to_default.to_string(),
        };
        Ok(sub_rightmost(from_restriction, &target, &full))
    }
}

/// Match with the largest start position
fn rightmost<'h>(re: &Regex, haystack: &'h str) -> Option<Match<'h>> {
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(haystack.len()))
        .rev()
        .find_map(|start| re.find_at(haystack, start).filter(|m| m.start() == start))
}

/// Replace the rightmost match, or append when nothing matches
fn sub_rightmost(re: &Regex, replacement: &str, haystack: &str) -> String {
    match rightmost(re, haystack) {
        Some(m) => format!(
            "{}{}{}",
            &haystack[..m.start()],
            replacement,
            &haystack[m.end()..]
        ),
        None => format!("{}{}", haystack, replacement),
    }
}

fn order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

/// dpkg's version fragment comparison
fn verrevcmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);
    let digit = |s: &[u8], k: usize| s.get(k).is_some_and(|c| c.is_ascii_digit());

    while i < a.len() || j < b.len() {
        while (i < a.len() && !digit(a, i)) || (j < b.len() && !digit(b, j)) {
            let ac = order(a.get(i).copied());
            let bc = order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while a.get(i) == Some(&b'0') {
            i += 1;
        }
        while b.get(j) == Some(&b'0') {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while digit(a, i) && digit(b, j) {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }

        if digit(a, i) {
            return Ordering::Greater;
        }
        if digit(b, j) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}

impl fmt::Display for DebianVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.upstream)?;
        if let Some(ref revision) = self.revision {
            write!(f, "-{}", revision)?;
        }
        Ok(())
    }
}

impl Ord for DebianVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for DebianVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two version strings, falling back to byte order for unparsable input
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (DebianVersion::parse(a), DebianVersion::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn v(s: &str) -> DebianVersion {
        DebianVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse() {
        let ver = v("2:1.2.3-1~test120+1");
        assert_eq!(ver.epoch, 2);
        assert_eq!(ver.upstream, "1.2.3");
        assert_eq!(ver.revision.as_deref(), Some("1~test120+1"));
        assert_eq!(ver.to_string(), "2:1.2.3-1~test120+1");

        let ver = v("1.0-2-3");
        assert_eq!(ver.upstream, "1.0-2");
        assert_eq!(ver.revision.as_deref(), Some("3"));

        assert!(DebianVersion::parse("x:1.0").is_err());
        assert!(DebianVersion::parse("abc").is_err());
        assert!(DebianVersion::parse("1.0-").is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.0-1") < v("1.0-2"));
        assert!(v("1.0-1") < v("1.1-1"));
        assert!(v("1.0~rc1-1") < v("1.0-1"));
        assert!(v("1.0-1~test120+1") < v("1.0-1"));
        assert!(v("1.0-1~test120+1") < v("1.0-1~test120+2"));
        assert!(v("1:0.9") > v("1.0"));
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.0a") > v("1.0"));
        assert!(v("1.0+b1") > v("1.0"));
        assert_eq!(v("1.0-1").cmp(&v("1.0-01")), Ordering::Equal);
        assert_eq!(v("1.0").cmp(&v("1.0-0")), Ordering::Equal);
    }

    #[test]
    fn test_internal_port() {
        let sid = Regex::new(r"~testSID\+[1-9]").unwrap();
        let sid_exp = Regex::new(r"~testSID\+0").unwrap();
        let wheezy = Regex::new(r"~test70\+[1-9]").unwrap();

        let cases = [
            ("1.2.3-1~testSID+1", &sid, "~test70+1", "1.2.3-1~test70+1"),
            ("1.2.3-1~testSID+4", &sid, "~test70+1", "1.2.3-1~test70+4"),
            ("1.2.3-1~testSID+4fud15", &sid, "~test70+1", "1.2.3-1~test70+4fud15"),
            ("1.2.3-1~testSID+0exp2", &sid_exp, "~test70+0", "1.2.3-1~test70+0exp2"),
            ("1.2.3-1~test70+4", &wheezy, "~test60+1", "1.2.3-1~test60+4"),
        ];
        for (from, re, to_default, expected) in cases {
            assert_eq!(v(from).internal_port(re, to_default).unwrap(), expected);
        }

        let any = Regex::new(".*").unwrap();
        assert_eq!(v("1.2.3-1").internal_port(&any, "~port+1").unwrap(), "1.2.3-1~port+1");
    }

    #[test]
    fn test_internal_rebuild_replaces_stamp() {
        let t1 = Utc.with_ymd_and_hms(2026, 2, 15, 10, 4, 53).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 2, 17, 12, 5, 17).unwrap();

        let first = v("1.2.3").internal_rebuild(t1);
        assert_eq!(first, "1.2.3+rebuilt20260215100453");
        assert_eq!(v(&first).internal_rebuild(t2), "1.2.3+rebuilt20260217120517");
    }

    #[test]
    fn test_external_port() {
        assert_eq!(v("1.2.3").external_port("~test60+1"), "1.2.3~test60+1");
    }
}
