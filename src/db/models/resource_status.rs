// src/db/models/resource_status.rs

//! Managed resource lifecycle records

use super::parse_timestamp;
use crate::error::{Error, Result};
use crate::status::{CheckFlag, ResourceKind, Status, StatusRecord};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ResourceStatusRow {
    pub kind: String,
    pub key: String,
    pub status: String,
    pub flag: String,
    pub last_checked: Option<String>,
    pub last_error: Option<String>,
    /// Digest of the resource configuration the record was written under
    pub fingerprint: Option<String>,
}

impl ResourceStatusRow {
    pub fn from_record(kind: ResourceKind, key: &str, record: &StatusRecord, fingerprint: &str) -> Self {
        Self {
            kind: kind.to_string(),
            key: key.to_string(),
            status: record.status.to_string(),
            flag: record.flag.to_string(),
            last_checked: record.last_checked.map(|at| at.to_rfc3339()),
            last_error: record.last_error.clone(),
            fingerprint: Some(fingerprint.to_string()).filter(|f| !f.is_empty()),
        }
    }

    pub fn to_record(&self) -> Result<StatusRecord> {
        let status = Status::from_str(&self.status)
            .map_err(|_| Error::ParseError(format!("unknown status '{}'", self.status)))?;
        let flag = CheckFlag::from_str(&self.flag)
            .map_err(|_| Error::ParseError(format!("unknown flag '{}'", self.flag)))?;
        let last_checked = self
            .last_checked
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        Ok(StatusRecord {
            status,
            flag,
            last_checked,
            last_error: self.last_error.clone(),
        })
    }

    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO resource_status (kind, key, status, flag, last_checked, last_error, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(kind, key) DO UPDATE SET
                status = excluded.status,
                flag = excluded.flag,
                last_checked = excluded.last_checked,
                last_error = excluded.last_error,
                fingerprint = excluded.fingerprint",
            params![
                &self.kind,
                &self.key,
                &self.status,
                &self.flag,
                &self.last_checked,
                &self.last_error,
                &self.fingerprint
            ],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, kind: ResourceKind, key: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT kind, key, status, flag, last_checked, last_error, fingerprint
             FROM resource_status WHERE kind = ?1 AND key = ?2",
        )?;
        Ok(stmt
            .query_row(params![kind.to_string(), key], Self::from_row)
            .optional()?)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT kind, key, status, flag, last_checked, last_error, fingerprint
             FROM resource_status ORDER BY kind, key",
        )?;
        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            kind: row.get(0)?,
            key: row.get(1)?,
            status: row.get(2)?,
            flag: row.get(3)?,
            last_checked: row.get(4)?,
            last_error: row.get(5)?,
            fingerprint: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Utc;

    #[test]
    fn test_record_survives_round_trip() {
        let conn = db::open_in_memory().unwrap();
        let record = StatusRecord {
            status: Status::Prepared,
            flag: CheckFlag::FailedReactivate,
            last_checked: Some(Utc::now()),
            last_error: Some("schroot: no such chroot".into()),
        };
        ResourceStatusRow::from_record(ResourceKind::Chroot, "mbd-sid-amd64", &record, "ab12")
            .upsert(&conn)
            .unwrap();

        let row = ResourceStatusRow::find(&conn, ResourceKind::Chroot, "mbd-sid-amd64")
            .unwrap()
            .unwrap();
        let back = row.to_record().unwrap();
        assert_eq!(back.status, Status::Prepared);
        assert_eq!(back.flag, CheckFlag::FailedReactivate);
        assert_eq!(back.last_error, record.last_error);
        assert_eq!(row.fingerprint.as_deref(), Some("ab12"));
        assert_eq!(ResourceStatusRow::list_all(&conn).unwrap().len(), 1);
    }
}
