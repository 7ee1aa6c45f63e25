// src/db/models/repository_entry.rs

//! Persisted rollback ring contents
//!
//! One row per occupied ring slot. Slot 0 is the active entry, slot `k`
//! (k >= 1) holds rollback `k - 1`. Rings are always rewritten as a whole,
//! guarded by a per-ring generation counter.

use super::json_list;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Identity of one rollback ring
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RingKey {
    pub repository: String,
    pub package: String,
    pub distribution: String,
}

impl RingKey {
    pub fn new(repository: &str, package: &str, distribution: &str) -> Self {
        Self {
            repository: repository.to_string(),
            package: package.to_string(),
            distribution: distribution.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRow {
    pub repository: String,
    pub package: String,
    pub distribution: String,
    pub slot: i64,
    pub version: String,
    pub component: String,
    pub artifacts: Vec<String>,
    pub installed_at: String,
}

const COLUMNS: &str =
    "repository, package, distribution, slot, version, component, artifacts, installed_at";

impl EntryRow {
    /// All rows of one ring, active first
    pub fn load_ring(conn: &Connection, key: &RingKey) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM repository_entries
             WHERE repository = ?1 AND package = ?2 AND distribution = ?3
             ORDER BY slot",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![&key.repository, &key.package, &key.distribution],
                Self::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Current generation of a ring; 0 if it was never written
    pub fn generation(conn: &Connection, key: &RingKey) -> Result<i64> {
        let generation = conn
            .query_row(
                "SELECT generation FROM ring_generations
                 WHERE repository = ?1 AND package = ?2 AND distribution = ?3",
                params![&key.repository, &key.package, &key.distribution],
                |row| row.get(0),
            )
            .optional()?;
        Ok(generation.unwrap_or(0))
    }

    /// Replace a ring's rows if nobody wrote it since `expected_generation`
    ///
    /// Must run inside a transaction. Returns the new generation.
    pub fn replace_ring(
        conn: &Connection,
        key: &RingKey,
        expected_generation: i64,
        rows: &[EntryRow],
    ) -> Result<i64> {
        let current = Self::generation(conn, key)?;
        if current != expected_generation {
            return Err(Error::ConcurrencyViolation(format!(
                "ring {}/{}/{} changed underneath (generation {} != {})",
                key.repository, key.package, key.distribution, current, expected_generation
            )));
        }

        conn.execute(
            "DELETE FROM repository_entries
             WHERE repository = ?1 AND package = ?2 AND distribution = ?3",
            params![&key.repository, &key.package, &key.distribution],
        )?;

        for row in rows {
            conn.execute(
                "INSERT INTO repository_entries
                    (repository, package, distribution, slot, version, component, artifacts, installed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &key.repository,
                    &key.package,
                    &key.distribution,
                    row.slot,
                    &row.version,
                    &row.component,
                    serde_json::to_string(&row.artifacts)?,
                    &row.installed_at,
                ],
            )?;
        }

        let next = current + 1;
        conn.execute(
            "INSERT INTO ring_generations (repository, package, distribution, generation)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repository, package, distribution) DO UPDATE SET generation = excluded.generation",
            params![&key.repository, &key.package, &key.distribution, next],
        )?;
        Ok(next)
    }

    /// Active entries of one distribution
    pub fn list_active(conn: &Connection, repository: &str, distribution: &str) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM repository_entries
             WHERE repository = ?1 AND distribution = ?2 AND slot = 0
             ORDER BY package",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![repository, distribution], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every entry of a repository, including rollbacks
    pub fn list_repository(conn: &Connection, repository: &str) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM repository_entries WHERE repository = ?1
             ORDER BY distribution, package, slot",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([repository], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of ring slots, anywhere, still referencing an artifact path
    pub fn artifact_references(conn: &Connection, path: &str) -> Result<i64> {
        let needle = serde_json::to_string(path)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM repository_entries WHERE instr(artifacts, ?1) > 0",
            [needle],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let artifacts: String = row.get(6)?;
        Ok(Self {
            repository: row.get(0)?,
            package: row.get(1)?,
            distribution: row.get(2)?,
            slot: row.get(3)?,
            version: row.get(4)?,
            component: row.get(5)?,
            artifacts: json_list(&artifacts),
            installed_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn entry(slot: i64, version: &str) -> EntryRow {
        EntryRow {
            repository: "test".into(),
            package: "foo".into(),
            distribution: "sid-test-unstable".into(),
            slot,
            version: version.into(),
            component: "main".into(),
            artifacts: vec![format!("pool/foo/{}/foo.deb", version)],
            installed_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn test_replace_ring_bumps_generation() {
        let mut conn = db::open_in_memory().unwrap();
        let key = RingKey::new("test", "foo", "sid-test-unstable");

        let next = db::transaction(&mut conn, |tx| {
            EntryRow::replace_ring(tx, &key, 0, &[entry(0, "1.1"), entry(1, "1.0")])
        })
        .unwrap();
        assert_eq!(next, 1);

        let ring = EntryRow::load_ring(&conn, &key).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].version, "1.1");
        assert_eq!(EntryRow::list_active(&conn, "test", "sid-test-unstable").unwrap().len(), 1);
        assert_eq!(EntryRow::artifact_references(&conn, "pool/foo/1.0/foo.deb").unwrap(), 1);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let mut conn = db::open_in_memory().unwrap();
        let key = RingKey::new("test", "foo", "sid-test-unstable");
        db::transaction(&mut conn, |tx| EntryRow::replace_ring(tx, &key, 0, &[entry(0, "1.0")]))
            .unwrap();

        let stale = db::transaction(&mut conn, |tx| {
            EntryRow::replace_ring(tx, &key, 0, &[entry(0, "2.0")])
        });
        assert!(matches!(stale, Err(Error::ConcurrencyViolation(_))));
        assert_eq!(EntryRow::load_ring(&conn, &key).unwrap()[0].version, "1.0");
    }
}
