//! SQLite-backed register of identities and attendance events.

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use rollcall_core::Identity;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        roll_number TEXT NOT NULL DEFAULT '',
        class TEXT NOT NULL DEFAULT '',
        section TEXT NOT NULL DEFAULT '',
        registration_number TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id INTEGER NOT NULL REFERENCES identities(id),
        name TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS attendance_identity ON attendance(identity_id);
";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed timestamp in database: {0:?}")]
    BadTimestamp(String),
}

/// Registration details for a new identity.
#[derive(Debug, Clone, Default)]
pub struct NewIdentity {
    pub name: String,
    pub roll_number: String,
    pub class: String,
    pub section: String,
    pub registration_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityRecord {
    pub id: Identity,
    pub name: String,
    pub roll_number: String,
    pub class: String,
    pub section: String,
    pub registration_number: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity: Identity,
    pub name: String,
    pub timestamp: NaiveDateTime,
}

/// Presence within one class/section over a period.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAttendance {
    pub class: String,
    pub section: String,
    /// Distinct identities with at least one event in the period.
    pub present: usize,
    /// Identities enrolled in this class/section.
    pub total: usize,
}

impl ClassAttendance {
    /// Percentage present, rounded to two decimals.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.present as f64 / self.total as f64 * 10_000.0).round() / 100.0
    }
}

/// Lifetime attendance of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceSummary {
    pub id: Identity,
    pub name: String,
    pub roll_number: String,
    pub class: String,
    pub section: String,
    pub events: usize,
    pub last_seen: Option<NaiveDateTime>,
}

/// Window of attendance events to report, relative to the local date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Period {
    Today,
    Week,
    Month,
    All,
}

impl Period {
    /// First calendar day included, `None` for no lower bound.
    fn since(self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            Period::Today => Some(today),
            Period::Week => Some(today - Duration::days(7)),
            Period::Month => Some(today - Duration::days(30)),
            Period::All => None,
        }
    }
}

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let ledger = Self::from_connection(Connection::open(path)?)?;
        tracing::debug!(path = %path.display(), "ledger opened");
        Ok(ledger)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn create_identity(&self, new: &NewIdentity) -> Result<Identity, LedgerError> {
        let created_at = Local::now().naive_local();
        self.conn.execute(
            "INSERT INTO identities (name, roll_number, class, section, registration_number, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.name,
                new.roll_number,
                new.class,
                new.section,
                new.registration_number,
                format_timestamp(&created_at),
            ],
        )?;
        let id = Identity(self.conn.last_insert_rowid());
        tracing::info!(%id, name = %new.name, "identity created");
        Ok(id)
    }

    pub fn get_identity(&self, id: Identity) -> Result<Option<IdentityRecord>, LedgerError> {
        self.conn
            .query_row(
                "SELECT id, name, roll_number, class, section, registration_number, created_at
                 FROM identities WHERE id = ?1",
                params![id.get()],
                |row| Ok(read_identity(row)),
            )
            .optional()?
            .transpose()
    }

    /// Most recently created first.
    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, roll_number, class, section, registration_number, created_at
             FROM identities ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok(read_identity(row)))?;
        let records = rows.map(|r| r?).collect::<Result<Vec<_>, LedgerError>>();
        records
    }

    /// Remove an identity and all of its attendance events.
    ///
    /// Returns whether the identity existed.
    pub fn delete_identity(&mut self, id: Identity) -> Result<bool, LedgerError> {
        let tx = self.conn.transaction()?;
        let events = tx.execute("DELETE FROM attendance WHERE identity_id = ?1", params![id.get()])?;
        let removed = tx.execute("DELETE FROM identities WHERE id = ?1", params![id.get()])?;
        tx.commit()?;
        tracing::info!(%id, events, existed = removed > 0, "identity deleted");
        Ok(removed > 0)
    }

    pub fn record_attendance(
        &self,
        id: Identity,
        name: &str,
        timestamp: NaiveDateTime,
    ) -> Result<i64, LedgerError> {
        self.conn.execute(
            "INSERT INTO attendance (identity_id, name, timestamp) VALUES (?1, ?2, ?3)",
            params![id.get(), name, format_timestamp(&timestamp)],
        )?;
        tracing::info!(%id, name, "attendance recorded");
        Ok(self.conn.last_insert_rowid())
    }

    /// Attendance events in `period`, newest first.
    pub fn attendance(&self, period: Period) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.attendance_as_of(period, Local::now().date_naive())
    }

    fn attendance_as_of(&self, period: Period, today: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        // A NULL lower bound passes every row.
        let since = period.since(today).map(|d| d.to_string());
        let mut stmt = self.conn.prepare(
            "SELECT id, identity_id, name, timestamp FROM attendance
             WHERE ?1 IS NULL OR date(timestamp) >= ?1
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let records = rows
            .map(|r| -> Result<AttendanceRecord, LedgerError> {
                let (id, identity, name, timestamp) = r?;
                Ok(AttendanceRecord {
                    id,
                    identity: Identity(identity),
                    name,
                    timestamp: parse_timestamp(&timestamp)?,
                })
            })
            .collect::<Result<Vec<_>, _>>();
        records
    }

    /// Distinct identities with at least one event today.
    pub fn count_present_today(&self) -> Result<usize, LedgerError> {
        self.count_present_on(Local::now().date_naive())
    }

    fn count_present_on(&self, day: NaiveDate) -> Result<usize, LedgerError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT identity_id) FROM attendance WHERE date(timestamp) = ?1",
            params![day.to_string()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn count_identities(&self) -> Result<usize, LedgerError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Per class/section presence in `period`, ordered by class then section.
    pub fn class_attendance(&self, period: Period) -> Result<Vec<ClassAttendance>, LedgerError> {
        self.class_attendance_as_of(period, Local::now().date_naive())
    }

    fn class_attendance_as_of(&self, period: Period, today: NaiveDate) -> Result<Vec<ClassAttendance>, LedgerError> {
        let since = period.since(today).map(|d| d.to_string());
        let mut stmt = self.conn.prepare(
            "SELECT i.class, i.section, COUNT(DISTINCT a.identity_id), COUNT(DISTINCT i.id)
             FROM identities i
             LEFT JOIN attendance a
                ON a.identity_id = i.id AND (?1 IS NULL OR date(a.timestamp) >= ?1)
             GROUP BY i.class, i.section
             ORDER BY i.class, i.section",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(ClassAttendance {
                class: row.get(0)?,
                section: row.get(1)?,
                present: row.get::<_, i64>(2)? as usize,
                total: row.get::<_, i64>(3)? as usize,
            })
        })?;
        let classes = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(classes)
    }

    /// Event count and last event per identity, most events first.
    pub fn attendance_summary(&self) -> Result<Vec<AttendanceSummary>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.name, i.roll_number, i.class, i.section, COUNT(a.id), MAX(a.timestamp)
             FROM identities i
             LEFT JOIN attendance a ON a.identity_id = i.id
             GROUP BY i.id
             ORDER BY COUNT(a.id) DESC, i.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                AttendanceSummary {
                    id: Identity(row.get(0)?),
                    name: row.get(1)?,
                    roll_number: row.get(2)?,
                    class: row.get(3)?,
                    section: row.get(4)?,
                    events: row.get::<_, i64>(5)? as usize,
                    last_seen: None,
                },
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let summaries = rows
            .map(|r| -> Result<AttendanceSummary, LedgerError> {
                let (mut summary, last) = r?;
                summary.last_seen = last.as_deref().map(parse_timestamp).transpose()?;
                Ok(summary)
            })
            .collect::<Result<Vec<_>, _>>();
        summaries
    }

    /// Events per calendar day for the last `days` days, oldest first, today included.
    pub fn daily_counts(&self, days: u32) -> Result<Vec<(NaiveDate, usize)>, LedgerError> {
        self.daily_counts_as_of(days, Local::now().date_naive())
    }

    fn daily_counts_as_of(&self, days: u32, today: NaiveDate) -> Result<Vec<(NaiveDate, usize)>, LedgerError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let first = today - Duration::days(i64::from(days) - 1);

        let mut stmt = self.conn.prepare(
            "SELECT date(timestamp), COUNT(*) FROM attendance
             WHERE date(timestamp) BETWEEN ?1 AND ?2
             GROUP BY date(timestamp)",
        )?;
        let rows = stmt.query_map(params![first.to_string(), today.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = std::collections::HashMap::new();
        for row in rows {
            let (day, n) = row?;
            counts.insert(day, n as usize);
        }

        Ok(first
            .iter_days()
            .take(days as usize)
            .map(|day| (day, counts.get(&day.to_string()).copied().unwrap_or(0)))
            .collect())
    }
}

fn read_identity(row: &Row<'_>) -> Result<IdentityRecord, LedgerError> {
    let created_at: String = row.get(6)?;
    Ok(IdentityRecord {
        id: Identity(row.get(0)?),
        name: row.get(1)?,
        roll_number: row.get(2)?,
        class: row.get(3)?,
        section: row.get(4)?,
        registration_number: row.get(5)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, LedgerError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|_| LedgerError::BadTimestamp(value.to_string()))
}
