//! SQLite-backed attendance store.
//!
//! Holds the four tables (students, face encodings, login sessions and the
//! append-only attendance log). Ledger writes go through
//! [`Store::transaction`] and the free functions at the bottom of this module
//! so that every accepted action commits atomically.

use crate::clock::{format_timestamp, parse_timestamp};
use crate::migrations;
use crate::types::{AttendanceStatus, Embedding, EnrolledFace, Student, StudentId};
use chrono::NaiveDateTime;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

// Shape check for stored times (fractional seconds allowed); anything else is
// cleared by `reconcile`.
const TIMESTAMP_GLOB: &str =
    "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9] [0-9][0-9]:[0-9][0-9]:[0-9][0-9]";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("student {0} not found")]
    StudentNotFound(StudentId),
}

/// A row of `login_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginSession {
    pub id: i64,
    pub student_id: StudentId,
    pub login_time: Option<String>,
    pub logout_time: Option<String>,
    /// Seconds, summed over the session's accepted logouts.
    pub accumulated_duration: i64,
}

impl LoginSession {
    pub fn is_open(&self) -> bool {
        self.logout_time.is_none()
    }

    pub fn login_at(&self) -> Option<NaiveDateTime> {
        self.login_time.as_deref().and_then(parse_timestamp)
    }
}

/// A row of the append-only `attendance` log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub student_id: StudentId,
    pub name: String,
    pub class: String,
    pub logged_in_time: Option<String>,
    pub logged_out_time: Option<String>,
    pub status: AttendanceStatus,
}

/// One line of the roster overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    #[serde(flatten)]
    pub student: Student,
    pub last_login: Option<String>,
    pub last_logout: Option<String>,
    /// Seconds across all of the student's sessions.
    pub total_duration: i64,
}

/// What [`Store::reconcile`] had to fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Open sessions closed because a newer open session exists.
    pub sessions_closed: usize,
    /// Malformed login/logout times reset to null.
    pub timestamps_cleared: usize,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub students: i64,
    pub open_sessions: i64,
    pub attendance_events: i64,
    pub schema_version: u32,
}

impl ToSql for AttendanceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AttendanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        AttendanceStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown attendance status `{s}`").into()))
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let version = migrations::run(&mut conn)?;
        tracing::debug!(version, journal = %journal, "schema up to date");
        Ok(Self { conn })
    }

    /// Begin a write transaction on the underlying connection.
    pub fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self.conn.transaction()?)
    }

    /// Startup repair pass.
    ///
    /// Clears malformed or impossible stored times, then closes every open session except
    /// the most recently opened one per student. A closed duplicate gets its
    /// own login time as logout time (or, if that is missing, the surviving
    /// session's login time, or `now`). Durations of repaired rows are not
    /// adjusted.
    pub fn reconcile(&mut self, now: NaiveDateTime) -> Result<RepairReport, StoreError> {
        let tx = self.conn.transaction()?;
        let mut report = RepairReport::default();

        report.timestamps_cleared += tx.execute(
            "UPDATE login_sessions SET login_time = NULL
             WHERE login_time IS NOT NULL
               AND NOT (login_time GLOB ?1 OR login_time GLOB ?1 || '.[0-9]*')",
            [TIMESTAMP_GLOB],
        )?;
        report.timestamps_cleared += tx.execute(
            "UPDATE login_sessions SET logout_time = NULL
             WHERE logout_time IS NOT NULL
               AND NOT (logout_time GLOB ?1 OR logout_time GLOB ?1 || '.[0-9]*')",
            [TIMESTAMP_GLOB],
        )?;

        // Right shape is not enough: `2024-02-30 09:00:00` or a junk fraction
        // still has to go.
        let unparsable: Vec<(i64, bool, bool)> = {
            let mut stmt = tx.prepare(
                "SELECT id, login_time, logout_time FROM login_sessions
                 WHERE login_time IS NOT NULL OR logout_time IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let id: i64 = row.get(0)?;
                    let login: Option<String> = row.get(1)?;
                    let logout: Option<String> = row.get(2)?;
                    let bad = |t: &Option<String>| {
                        t.as_deref().is_some_and(|t| parse_timestamp(t).is_none())
                    };
                    Ok((id, bad(&login), bad(&logout)))
                })?
                .filter(|r| !matches!(r, Ok((_, false, false))))
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (session_id, bad_login, bad_logout) in unparsable {
            if bad_login {
                tx.execute(
                    "UPDATE login_sessions SET login_time = NULL WHERE id = ?1",
                    [session_id],
                )?;
                report.timestamps_cleared += 1;
            }
            if bad_logout {
                tx.execute(
                    "UPDATE login_sessions SET logout_time = NULL WHERE id = ?1",
                    [session_id],
                )?;
                report.timestamps_cleared += 1;
            }
        }

        let open: Vec<(StudentId, i64, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT student_id, id, login_time FROM login_sessions
                 WHERE logout_time IS NULL
                 ORDER BY student_id, login_time DESC, id DESC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let fallback_now = format_timestamp(now);
        let mut survivors: HashMap<StudentId, Option<String>> = HashMap::new();
        for (student_id, session_id, login_time) in open {
            let Some(survivor_login) = survivors.get(&student_id) else {
                survivors.insert(student_id, login_time);
                continue;
            };
            let logout_time = login_time
                .or_else(|| survivor_login.clone())
                .unwrap_or_else(|| fallback_now.clone());
            tx.execute(
                "UPDATE login_sessions SET logout_time = ?1 WHERE id = ?2",
                params![logout_time, session_id],
            )?;
            tracing::warn!(
                student_id,
                session_id,
                logout_time = %logout_time,
                "closed duplicate open session"
            );
            report.sessions_closed += 1;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Insert a student and their enrollment embedding in one transaction.
    pub fn insert_student(
        &mut self,
        name: &str,
        class: &str,
        embedding: &Embedding,
    ) -> Result<Student, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO students (name, class) VALUES (?1, ?2)",
            params![name, class],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO face_encodings (student_id, face_encoding) VALUES (?1, ?2)",
            params![id, embedding.to_blob()],
        )?;
        tx.commit()?;
        Ok(Student {
            id,
            name: name.to_string(),
            class: class.to_string(),
        })
    }

    pub fn student(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        let student = self
            .conn
            .query_row(
                "SELECT id, name, class FROM students WHERE id = ?1",
                [id],
                student_from_row,
            )
            .optional()?;
        Ok(student)
    }

    /// Every student with a usable enrollment embedding.
    ///
    /// Rows whose blob cannot be decoded are skipped with a warning so one bad
    /// row does not take matching down for everyone.
    pub fn enrolled_faces(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.class, f.face_encoding
             FROM students s JOIN face_encodings f ON s.id = f.student_id
             ORDER BY s.id, f.id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((student_from_row(row)?, row.get::<_, Vec<u8>>(3)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(student, blob)| match Embedding::from_blob(&blob) {
                Some(embedding) => Some(EnrolledFace { student, embedding }),
                None => {
                    tracing::warn!(
                        student_id = student.id,
                        bytes = blob.len(),
                        "skipping undecodable face encoding"
                    );
                    None
                }
            })
            .collect())
    }

    /// Delete a student and everything that references them.
    ///
    /// Dependents are deleted explicitly as well, since databases created by
    /// older versions have no cascading foreign keys. Returns `false` if the
    /// student did not exist.
    pub fn delete_student(&mut self, id: StudentId) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM face_encodings WHERE student_id = ?1", [id])?;
        tx.execute("DELETE FROM login_sessions WHERE student_id = ?1", [id])?;
        tx.execute("DELETE FROM attendance WHERE student_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM students WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// The open session of a student, if any.
    pub fn open_session(&self, student_id: StudentId) -> Result<Option<LoginSession>, StoreError> {
        find_open_session(&self.conn, student_id)
    }

    /// Student owning the most recently opened open session across everyone.
    pub fn latest_open_session(&self) -> Result<Option<(Student, LoginSession)>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT s.id, s.name, s.class,
                        l.id, l.student_id, l.login_time, l.logout_time, l.class_duration
                 FROM login_sessions l JOIN students s ON l.student_id = s.id
                 WHERE l.logout_time IS NULL
                 ORDER BY l.login_time DESC, l.id DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        student_from_row(row)?,
                        LoginSession {
                            id: row.get(3)?,
                            student_id: row.get(4)?,
                            login_time: row.get(5)?,
                            logout_time: row.get(6)?,
                            accumulated_duration: row.get(7)?,
                        },
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// A student's sessions, newest first.
    pub fn sessions_for(&self, student_id: StudentId) -> Result<Vec<LoginSession>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, student_id, login_time, logout_time, class_duration
             FROM login_sessions WHERE student_id = ?1
             ORDER BY login_time DESC, id DESC",
        )?;
        let sessions = stmt
            .query_map([student_id], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Every student with their latest login/logout and total time, by id.
    pub fn roster(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.class,
                    MAX(l.login_time), MAX(l.logout_time), COALESCE(SUM(l.class_duration), 0)
             FROM students s LEFT JOIN login_sessions l ON l.student_id = s.id
             GROUP BY s.id, s.name, s.class
             ORDER BY s.id",
        )?;
        let roster = stmt
            .query_map([], |row| {
                Ok(RosterEntry {
                    student: student_from_row(row)?,
                    last_login: row.get(3)?,
                    last_logout: row.get(4)?,
                    total_duration: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(roster)
    }

    /// Attendance events, newest first, optionally for one student.
    pub fn attendance_log(
        &self,
        student_id: Option<StudentId>,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, student_id, name, class, logged_in_time, logged_out_time, status
             FROM attendance
             WHERE ?1 IS NULL OR student_id = ?1
             ORDER BY id DESC",
        )?;
        let events = stmt
            .query_map([student_id], |row| {
                Ok(AttendanceEvent {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    name: row.get(2)?,
                    class: row.get(3)?,
                    logged_in_time: row.get(4)?,
                    logged_out_time: row.get(5)?,
                    status: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let count = |sql: &str| -> rusqlite::Result<i64> {
            self.conn.query_row(sql, [], |r| r.get(0))
        };
        Ok(StoreStats {
            students: count("SELECT count(*) FROM students")?,
            open_sessions: count("SELECT count(*) FROM login_sessions WHERE logout_time IS NULL")?,
            attendance_events: count("SELECT count(*) FROM attendance")?,
            schema_version: migrations::current_version(&self.conn)?,
        })
    }
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        class: row.get(2)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<LoginSession> {
    Ok(LoginSession {
        id: row.get(0)?,
        student_id: row.get(1)?,
        login_time: row.get(2)?,
        logout_time: row.get(3)?,
        accumulated_duration: row.get(4)?,
    })
}

/// The most recently opened session of `student_id` without a logout time.
pub fn find_open_session(
    conn: &Connection,
    student_id: StudentId,
) -> Result<Option<LoginSession>, StoreError> {
    let session = conn
        .query_row(
            "SELECT id, student_id, login_time, logout_time, class_duration
             FROM login_sessions
             WHERE student_id = ?1 AND logout_time IS NULL
             ORDER BY login_time DESC, id DESC
             LIMIT 1",
            [student_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

pub fn insert_session(
    conn: &Connection,
    student_id: StudentId,
    login_time: NaiveDateTime,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO login_sessions (student_id, login_time, class_duration) VALUES (?1, ?2, 0)",
        params![student_id, format_timestamp(login_time)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn close_session(
    conn: &Connection,
    session_id: i64,
    logout_time: NaiveDateTime,
    accumulated_duration: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE login_sessions SET logout_time = ?1, class_duration = ?2 WHERE id = ?3",
        params![format_timestamp(logout_time), accumulated_duration, session_id],
    )?;
    Ok(())
}

/// Append one row to the attendance log.
pub fn append_event(
    conn: &Connection,
    student: &Student,
    status: AttendanceStatus,
    at: NaiveDateTime,
) -> Result<i64, StoreError> {
    let at = format_timestamp(at);
    let (logged_in, logged_out) = match status {
        AttendanceStatus::LoggedIn => (Some(at), None),
        AttendanceStatus::LoggedOut => (None, Some(at)),
    };
    conn.execute(
        "INSERT INTO attendance (student_id, name, class, logged_in_time, logged_out_time, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![student.id, student.name, student.class, logged_in, logged_out, status],
    )?;
    Ok(conn.last_insert_rowid())
}
