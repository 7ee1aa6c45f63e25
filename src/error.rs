// src/error.rs

//! Error types for autobuild

use thiserror::Error;

/// Result type alias using autobuild's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for autobuild
#[derive(Error, Debug)]
pub enum Error {
    /// Initialization failure (database, directories, runtime)
    #[error("Initialization error: {0}")]
    InitError(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    IoError(String),

    /// Requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input (distribution strings, upload options, versions)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Database failure
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid configuration: ambiguous meta-distributions, bad version restrictions
    #[error("Configuration error: {0}")]
    Config(String),

    /// No chroot session or peer available
    #[error("No capacity: {0}")]
    Capacity(String),

    /// Deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// QA or compile failure
    #[error("Build failed: {0}")]
    BuildFailed(String),

    /// Peer unreachable or refused authentication
    #[error("Network error: {0}")]
    Network(String),

    /// A rollback ring was mutated outside of its lock
    #[error("Concurrent modification: {0}")]
    ConcurrencyViolation(String),

    /// Operation needs an explicit confirmation token
    #[error("Confirmation required: repeat the command name '{0}' to proceed")]
    ConfirmationRequired(String),

    /// Status transition not allowed from the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Version string not accepted by a suite
    #[error("Version restriction: {0}")]
    VersionRestriction(String),

    /// Submission rejected at precheck
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the operation may succeed when tried again later or elsewhere
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Capacity(_) | Error::Timeout(_) | Error::Network(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(format!("JSON: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML: {}", err))
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Config(format!("invalid pattern: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}
