// src/db/models/submission.rs

//! Submission history

use super::json_list;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// One accepted (or rejected) submission
#[derive(Debug, Clone)]
pub struct SubmissionRow {
    pub id: Option<i64>,
    pub package: String,
    pub version: String,
    pub distribution: String,
    pub component: String,
    pub architectures: Vec<String>,
    /// Full submission record as JSON
    pub payload: String,
    pub status: String,
    pub outcome: Option<String>,
    pub reason: Option<String>,
    pub received_at: String,
    pub finished_at: Option<String>,
}

const COLUMNS: &str = "id, package, version, distribution, component, architectures, payload,
     status, outcome, reason, received_at, finished_at";

impl SubmissionRow {
    pub fn new(
        package: String,
        version: String,
        distribution: String,
        component: String,
        architectures: Vec<String>,
        payload: String,
    ) -> Self {
        Self {
            id: None,
            package,
            version,
            distribution,
            component,
            architectures,
            payload,
            status: "checking".to_string(),
            outcome: None,
            reason: None,
            received_at: Utc::now().to_rfc3339(),
            finished_at: None,
        }
    }

    /// Insert, replacing an earlier record with the same identity
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO submissions (package, version, distribution, component, architectures,
                                      payload, status, outcome, reason, received_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(package, version, distribution) DO UPDATE SET
                component = excluded.component,
                architectures = excluded.architectures,
                payload = excluded.payload,
                status = excluded.status,
                outcome = NULL,
                reason = NULL,
                received_at = excluded.received_at,
                finished_at = NULL",
            params![
                &self.package,
                &self.version,
                &self.distribution,
                &self.component,
                serde_json::to_string(&self.architectures)?,
                &self.payload,
                &self.status,
                &self.outcome,
                &self.reason,
                &self.received_at,
                &self.finished_at,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM submissions WHERE package = ?1 AND version = ?2 AND distribution = ?3",
            params![&self.package, &self.version, &self.distribution],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let sql = format!("SELECT {} FROM submissions WHERE id = ?1", COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.query_row([id], Self::from_row).optional()?)
    }

    /// Find the most recent submission of a package version, in any distribution
    pub fn find_by_package(conn: &Connection, package: &str, version: &str) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {} FROM submissions WHERE package = ?1 AND version = ?2
             ORDER BY received_at DESC LIMIT 1",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt
            .query_row(params![package, version], Self::from_row)
            .optional()?)
    }

    /// Submissions whose pipeline never finished
    pub fn list_unfinished(conn: &Connection) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM submissions WHERE finished_at IS NULL ORDER BY id",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest first
    pub fn list_recent(conn: &Connection, limit: i64) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM submissions ORDER BY id DESC LIMIT ?1",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([limit], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record a pipeline state change
    pub fn update_status(
        conn: &Connection,
        id: i64,
        status: &str,
        outcome: Option<&str>,
        reason: Option<&str>,
        finished: bool,
    ) -> Result<()> {
        let finished_at = finished.then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE submissions SET status = ?1, outcome = COALESCE(?2, outcome),
                    reason = COALESCE(?3, reason), finished_at = ?4
             WHERE id = ?5",
            params![status, outcome, reason, finished_at, id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let architectures: String = row.get(5)?;
        Ok(Self {
            id: Some(row.get(0)?),
            package: row.get(1)?,
            version: row.get(2)?,
            distribution: row.get(3)?,
            component: row.get(4)?,
            architectures: json_list(&architectures),
            payload: row.get(6)?,
            status: row.get(7)?,
            outcome: row.get(8)?,
            reason: row.get(9)?,
            received_at: row.get(10)?,
            finished_at: row.get(11)?,
        })
    }
}
