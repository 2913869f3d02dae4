//! Versioned schema migrations.
//!
//! Each step is idempotent and runs in its own transaction together with the
//! bump of the single `schema_meta` row, so a crash between steps leaves the
//! database at a well-defined version.

use rusqlite::{Connection, OptionalExtension, Transaction};

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base tables",
        apply: base_tables,
    },
    Migration {
        version: 2,
        name: "split attendance timestamp",
        apply: split_attendance_timestamp,
    },
    Migration {
        version: 3,
        name: "drop break records",
        apply: drop_break_records,
    },
];

/// Highest schema version this build knows about.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Current schema version recorded in the database (0 if never migrated).
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             version INTEGER NOT NULL
         )",
    )?;
    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the recorded version, in order.
///
/// Returns the resulting schema version.
pub fn run(conn: &mut Connection) -> rusqlite::Result<u32> {
    let start = current_version(conn)?;
    let mut version = start;

    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.execute(
            "INSERT INTO schema_meta (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        version = migration.version;
    }

    Ok(version)
}

const ATTENDANCE_TABLE: &str = "CREATE TABLE IF NOT EXISTS attendance (
     id INTEGER PRIMARY KEY,
     student_id INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
     name TEXT NOT NULL,
     class TEXT NOT NULL,
     logged_in_time TEXT,
     logged_out_time TEXT,
     status TEXT NOT NULL
 )";

fn base_tables(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS students (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             class TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS face_encodings (
             id INTEGER PRIMARY KEY,
             student_id INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
             face_encoding BLOB NOT NULL
         );
         CREATE TABLE IF NOT EXISTS login_sessions (
             id INTEGER PRIMARY KEY,
             student_id INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
             login_time TEXT,
             logout_time TEXT,
             class_duration INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS idx_face_encodings_student ON face_encodings(student_id);
         CREATE INDEX IF NOT EXISTS idx_login_sessions_student
             ON login_sessions(student_id, logout_time);",
    )?;
    // A legacy `attendance` table is left alone here; version 2 rebuilds it.
    if !table_exists(tx, "attendance")? {
        tx.execute_batch(ATTENDANCE_TABLE)?;
    }
    Ok(())
}

/// Older databases stored a single `timestamp` column on attendance rows.
/// Rebuild the table with separate login/logout columns, keeping the old value
/// as the login time.
fn split_attendance_timestamp(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !column_exists(tx, "attendance", "timestamp")? {
        return Ok(());
    }
    tx.execute_batch("ALTER TABLE attendance RENAME TO attendance_old")?;
    tx.execute_batch(ATTENDANCE_TABLE)?;
    let copied = tx.execute(
        "INSERT INTO attendance (id, student_id, name, class, logged_in_time, status)
         SELECT id, student_id, name, class, timestamp, status FROM attendance_old",
        [],
    )?;
    tx.execute_batch("DROP TABLE attendance_old")?;
    tracing::info!(rows = copied, "migrated legacy attendance rows");
    Ok(())
}

fn drop_break_records(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("DROP TABLE IF EXISTS break_records")
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE students (id INTEGER PRIMARY KEY, name TEXT, class TEXT);
             CREATE TABLE attendance (id INTEGER PRIMARY KEY, student_id INTEGER, name TEXT,
                                      class TEXT, timestamp TEXT, status TEXT);
             CREATE TABLE break_records (id INTEGER PRIMARY KEY);
             INSERT INTO students VALUES (1, 'Asha', '10A');
             INSERT INTO attendance
                 VALUES (5, 1, 'Asha', '10A', '2024-01-01 09:00:00', 'logged_in');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        assert_eq!(run(&mut conn).unwrap(), latest_version());
        assert!(table_exists(&conn, "students").unwrap());
        assert!(table_exists(&conn, "attendance").unwrap());
        assert!(column_exists(&conn, "attendance", "logged_out_time").unwrap());
    }

    #[test]
    fn test_run_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(run(&mut conn).unwrap(), latest_version());
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM schema_meta", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_legacy_attendance_is_split() {
        let mut conn = legacy_db();
        run(&mut conn).unwrap();

        assert!(!column_exists(&conn, "attendance", "timestamp").unwrap());
        assert!(!table_exists(&conn, "attendance_old").unwrap());
        let (login, logout, status): (Option<String>, Option<String>, String) = conn
            .query_row(
                "SELECT logged_in_time, logged_out_time, status FROM attendance WHERE id = 5",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(login.as_deref(), Some("2024-01-01 09:00:00"));
        assert_eq!(logout, None);
        assert_eq!(status, "logged_in");
    }

    #[test]
    fn test_each_pending_step_is_recorded() {
        let mut conn = legacy_db();
        conn.execute_batch(
            "CREATE TABLE schema_meta (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 version INTEGER NOT NULL
             );
             INSERT INTO schema_meta VALUES (1, 1);",
        )
        .unwrap();
        assert_eq!(run(&mut conn).unwrap(), latest_version());
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        assert!(!column_exists(&conn, "attendance", "timestamp").unwrap());
        assert!(!table_exists(&conn, "break_records").unwrap());
    }

    #[test]
    fn test_break_records_dropped() {
        let mut conn = legacy_db();
        run(&mut conn).unwrap();
        assert!(!table_exists(&conn, "break_records").unwrap());
    }

    #[test]
    fn test_pending_migrations_resume_from_recorded_version() {
        let mut conn = legacy_db();
        conn.execute_batch(
            "CREATE TABLE schema_meta (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 version INTEGER NOT NULL
             );
             INSERT INTO schema_meta VALUES (1, 2);",
        )
        .unwrap();
        // Version 2 is recorded as done, so only the break_records step runs.
        run(&mut conn).unwrap();
        assert!(column_exists(&conn, "attendance", "timestamp").unwrap());
        assert!(!table_exists(&conn, "break_records").unwrap());
    }
}
