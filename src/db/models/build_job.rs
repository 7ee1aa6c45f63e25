// src/db/models/build_job.rs

//! Per-architecture build job state and logs

use super::json_list;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{Connection, Row, params};

#[derive(Debug, Clone)]
pub struct BuildJobRow {
    pub id: Option<i64>,
    pub submission_id: i64,
    pub architecture: String,
    pub state: String,
    pub worker: Option<String>,
    pub attempts: i64,
    pub log: String,
    pub artifacts: Vec<String>,
    pub detail: Option<String>,
    pub updated_at: String,
}

impl BuildJobRow {
    pub fn new(submission_id: i64, architecture: String, state: String) -> Self {
        Self {
            id: None,
            submission_id,
            architecture,
            state,
            worker: None,
            attempts: 0,
            log: String::new(),
            artifacts: Vec::new(),
            detail: None,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    /// Insert or overwrite the job for (submission, architecture)
    pub fn upsert(&mut self, conn: &Connection) -> Result<i64> {
        self.updated_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO build_jobs (submission_id, architecture, state, worker, attempts, log,
                                     artifacts, detail, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(submission_id, architecture) DO UPDATE SET
                state = excluded.state,
                worker = excluded.worker,
                attempts = excluded.attempts,
                log = excluded.log,
                artifacts = excluded.artifacts,
                detail = excluded.detail,
                updated_at = excluded.updated_at",
            params![
                self.submission_id,
                &self.architecture,
                &self.state,
                &self.worker,
                self.attempts,
                &self.log,
                serde_json::to_string(&self.artifacts)?,
                &self.detail,
                &self.updated_at,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM build_jobs WHERE submission_id = ?1 AND architecture = ?2",
            params![self.submission_id, &self.architecture],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    pub fn list_for_submission(conn: &Connection, submission_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, submission_id, architecture, state, worker, attempts, log, artifacts,
                    detail, updated_at
             FROM build_jobs WHERE submission_id = ?1 ORDER BY architecture",
        )?;
        let rows = stmt
            .query_map([submission_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop all job rows of a submission before a fresh dispatch
    pub fn clear_for_submission(conn: &Connection, submission_id: i64) -> Result<()> {
        conn.execute("DELETE FROM build_jobs WHERE submission_id = ?1", [submission_id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let artifacts: String = row.get(7)?;
        Ok(Self {
            id: Some(row.get(0)?),
            submission_id: row.get(1)?,
            architecture: row.get(2)?,
            state: row.get(3)?,
            worker: row.get(4)?,
            attempts: row.get(5)?,
            log: row.get(6)?,
            artifacts: json_list(&artifacts),
            detail: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}
