// src/federation/protocol.rs
//! Wire types of the peer build protocol
//!
//! - `GET  /v1/status`        -> [`Advertisement`]
//! - `POST /v1/builds`        [`BuildRequest`] -> [`BuildResponse`]
//! - `POST /v1/builds/cancel` [`CancelRequest`]
//!
//! Requests carry the shared token in [`TOKEN_HEADER`]. Files travel inline
//! as base64.

use crate::build::{JobSpec, ResultKind, Submission};
use crate::chroot::ChrootKey;
use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATUS_PATH: &str = "v1/status";
pub const BUILDS_PATH: &str = "v1/builds";
pub const CANCEL_PATH: &str = "v1/builds/cancel";
pub const TOKEN_HEADER: &str = "x-autobuild-token";

/// A file shipped inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedFile {
    pub name: String,
    pub data: String,
}

impl EncodedFile {
    pub fn read(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::IoError(format!("bad file name {}", path.display())))?
            .to_string();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::IoError(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Self {
            name,
            data: STANDARD.encode(bytes),
        })
    }

    /// Decode into `dir`, refusing names that would leave it
    pub fn write_into(&self, dir: &Path) -> Result<PathBuf> {
        if self.name.is_empty()
            || self.name.contains('/')
            || self.name.contains('\\')
            || self.name == "."
            || self.name == ".."
        {
            return Err(Error::Rejected(format!("unsafe file name {:?}", self.name)));
        }
        let bytes = STANDARD
            .decode(&self.data)
            .map_err(|e| Error::ParseError(format!("{}: bad base64: {}", self.name, e)))?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// Source files belonging to a submission: every `<package>_*` file next to
/// its .dsc
pub fn source_files(submission: &Submission) -> Result<Vec<EncodedFile>> {
    let dir = submission
        .dsc
        .parent()
        .ok_or_else(|| Error::NotFound(format!("source directory of {}", submission.dsc.display())))?;
    let prefix = format!("{}_", submission.package);
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&prefix));
        if matches && path.is_file() {
            files.push(EncodedFile::read(&path)?);
        }
    }
    if !files.iter().any(|f| Some(f.name.as_str()) == submission.dsc.file_name().and_then(|n| n.to_str())) {
        return Err(Error::NotFound(submission.dsc.display().to_string()));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Caller-chosen id, used for cancellation
    pub request_id: String,
    /// Identity of the requesting instance
    pub origin: String,
    pub submission: Submission,
    pub job: JobSpec,
    pub sources: Vec<EncodedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    pub kind: ResultKind,
    pub detail: String,
    pub log: String,
    #[serde(default)]
    pub artifacts: Vec<EncodedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: String,
}

/// What a peer announces about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub identity: String,
    /// Whether the peer accepts builds at all
    pub active: bool,
    pub chroots: Vec<ChrootKey>,
    pub free_capacity: usize,
    pub max_capacity: usize,
    /// Busy fraction, 0.0 (idle) to 1.0 (full)
    pub load: f64,
}

impl Advertisement {
    pub fn hosts(&self, key: &ChrootKey) -> bool {
        self.chroots.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_round_trip_and_unsafe_names() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("foo_1.0-1.dsc");
        std::fs::write(&src, b"Format: 3.0 (quilt)\n").unwrap();

        let encoded = EncodedFile::read(&src).unwrap();
        let out = encoded.write_into(&temp.path().join("out")).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"Format: 3.0 (quilt)\n");

        for name in ["../evil", "a/b", ".."] {
            let bad = EncodedFile {
                name: name.into(),
                data: String::new(),
            };
            assert!(bad.write_into(temp.path()).is_err());
        }
    }

    #[test]
    fn test_source_files_picks_package_files() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["foo_1.0-1.dsc", "foo_1.0.orig.tar.gz", "bar_2.0.dsc"] {
            std::fs::write(temp.path().join(name), name).unwrap();
        }
        let submission = Submission::new(
            "foo",
            "1.0-1",
            "sid-test-unstable".parse().unwrap(),
            &["any"],
            temp.path().join("foo_1.0-1.dsc"),
        );
        let files = source_files(&submission).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["foo_1.0-1.dsc", "foo_1.0.orig.tar.gz"]);
    }
}
