// src/db/models/mod.rs

//! Row models for the autobuild database

mod build_job;
mod repository_entry;
mod resource_status;
mod submission;

pub use build_job::BuildJobRow;
pub use repository_entry::{EntryRow, RingKey};
pub use resource_status::ResourceStatusRow;
pub use submission::SubmissionRow;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp column
pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::ParseError(format!("timestamp '{}': {}", value, e)))
}

/// Decode a JSON string-list column, tolerating garbage as empty
pub(crate) fn json_list(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_default()
}
