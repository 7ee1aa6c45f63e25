// src/db/schema.rs

//! Database schema definitions and migrations
//!
//! Versioned the same way throughout: a `schema_version` table records
//! every applied step, and `migrate` brings older databases forward.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version >= SCHEMA_VERSION {
        debug!("[db] schema is up to date (version {})", current_version);
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("[db] applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::DatabaseError(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema: submissions, build jobs, repository entries, resource status
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE submissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT NOT NULL,
            version TEXT NOT NULL,
            distribution TEXT NOT NULL,
            component TEXT NOT NULL,
            architectures TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            outcome TEXT,
            reason TEXT,
            received_at TEXT NOT NULL,
            finished_at TEXT,
            UNIQUE(package, version, distribution)
        );

        CREATE INDEX idx_submissions_status ON submissions(status);

        CREATE TABLE build_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id INTEGER NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
            architecture TEXT NOT NULL,
            state TEXT NOT NULL,
            worker TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            log TEXT NOT NULL DEFAULT '',
            artifacts TEXT NOT NULL DEFAULT '[]',
            detail TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(submission_id, architecture)
        );

        CREATE TABLE repository_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository TEXT NOT NULL,
            package TEXT NOT NULL,
            distribution TEXT NOT NULL,
            slot INTEGER NOT NULL,
            version TEXT NOT NULL,
            component TEXT NOT NULL,
            artifacts TEXT NOT NULL DEFAULT '[]',
            installed_at TEXT NOT NULL,
            UNIQUE(repository, package, distribution, slot)
        );

        CREATE INDEX idx_repository_entries_dist ON repository_entries(repository, distribution);

        CREATE TABLE resource_status (
            kind TEXT NOT NULL,
            key TEXT NOT NULL,
            status TEXT NOT NULL,
            flag TEXT NOT NULL,
            last_checked TEXT,
            last_error TEXT,
            PRIMARY KEY (kind, key)
        );
        ",
    )?;
    Ok(())
}

/// Ring generations for optimistic write checks
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE ring_generations (
            repository TEXT NOT NULL,
            package TEXT NOT NULL,
            distribution TEXT NOT NULL,
            generation INTEGER NOT NULL,
            PRIMARY KEY (repository, package, distribution)
        );
        ",
    )?;
    Ok(())
}

/// Configuration fingerprints on resource status
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE resource_status ADD COLUMN fingerprint TEXT;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('submissions', 'build_jobs', 'repository_entries',
                              'resource_status', 'ring_generations')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
