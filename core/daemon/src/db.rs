//! SQLite persistence for logit-daemon.
//!
//! This is the single-writer store backing the monitor. Two tables: the
//! program catalog and the session ledger. Every operation opens its own
//! connection so the monitor thread and socket handlers never share one.

use chrono::{DateTime, SecondsFormat, Utc};
use logit_daemon_protocol::{Program, ProgramWithSessions, Session};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;

const SESSION_COLUMNS: &str =
    "s.session_id, s.program_id, s.start_time, s.end_time, s.duration_ms, s.session_number";
const PROGRAM_COLUMNS: &str = "p.program_id, p.program_name, p.first_seen, p.owner_id";

pub struct Db {
    path: PathBuf,
}

/// Open session joined with the program it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSession {
    pub session: Session,
    pub program: Program,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn find_program_by_name(&self, name: &str) -> Result<Option<Program>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM programs p WHERE p.program_name = ?1",
                    PROGRAM_COLUMNS
                ),
                params![name],
                |row| program_from_row(row, 0),
            )
            .optional()
            .map_err(|err| format!("Failed to query program by name: {}", err))
        })
    }

    pub fn get_program(&self, program_id: i64) -> Result<Option<Program>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM programs p WHERE p.program_id = ?1",
                    PROGRAM_COLUMNS
                ),
                params![program_id],
                |row| program_from_row(row, 0),
            )
            .optional()
            .map_err(|err| format!("Failed to query program: {}", err))
        })
    }

    /// Persists a new catalog entry. `program.program_id` is ignored and the
    /// assigned identity is returned.
    pub fn insert_program(&self, program: &Program) -> Result<Program, String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO programs (program_name, first_seen, owner_id) VALUES (?1, ?2, ?3)",
                params![
                    program.program_name,
                    format_timestamp(program.first_seen),
                    program.owner_id
                ],
            )
            .map_err(|err| format!("Failed to insert program: {}", err))?;

            Ok(Program {
                program_id: conn.last_insert_rowid(),
                ..program.clone()
            })
        })
    }

    pub fn count_sessions(&self, program_id: i64) -> Result<u32, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE program_id = ?1",
                params![program_id],
                |row| row.get::<_, u32>(0),
            )
            .map_err(|err| format!("Failed to count sessions: {}", err))
        })
    }

    /// Persists a new session row. `session.session_id` is ignored and the
    /// assigned identity is returned.
    pub fn insert_session(&self, session: &Session) -> Result<Session, String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions \
                    (program_id, start_time, end_time, duration_ms, session_number) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.program_id,
                    format_timestamp(session.start_time),
                    session.end_time.map(format_timestamp),
                    session.duration_ms,
                    session.session_number
                ],
            )
            .map_err(|err| format!("Failed to insert session: {}", err))?;

            Ok(Session {
                session_id: conn.last_insert_rowid(),
                ..session.clone()
            })
        })
    }

    /// Rewrites the end time and duration. Returns false when the row is gone.
    pub fn update_session(&self, session: &Session) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET end_time = ?2, duration_ms = ?3 WHERE session_id = ?1",
                    params![
                        session.session_id,
                        session.end_time.map(format_timestamp),
                        session.duration_ms
                    ],
                )
                .map_err(|err| format!("Failed to update session: {}", err))?;
            Ok(changed > 0)
        })
    }

    #[cfg(test)]
    pub fn get_session(&self, session_id: i64) -> Result<Option<Session>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sessions s WHERE s.session_id = ?1",
                    SESSION_COLUMNS
                ),
                params![session_id],
                |row| session_from_row(row, 0),
            )
            .optional()
            .map_err(|err| format!("Failed to query session: {}", err))
        })
    }

    pub fn query_open_sessions(&self) -> Result<Vec<OpenSession>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {}, {} FROM sessions s \
                     JOIN programs p ON p.program_id = s.program_id \
                     WHERE s.end_time IS NULL \
                     ORDER BY s.start_time ASC, s.session_id ASC",
                    SESSION_COLUMNS, PROGRAM_COLUMNS
                ))
                .map_err(|err| format!("Failed to prepare open sessions query: {}", err))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(OpenSession {
                        session: session_from_row(row, 0)?,
                        program: program_from_row(row, 6)?,
                    })
                })
                .map_err(|err| format!("Failed to query open sessions: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })
    }

    pub fn list_sessions_for_program(&self, program_id: i64) -> Result<Vec<Session>, String> {
        self.with_connection(|conn| list_sessions(conn, program_id))
    }

    pub fn list_programs(&self, active_only: bool) -> Result<Vec<Program>, String> {
        self.with_connection(|conn| {
            let filter = if active_only {
                "WHERE EXISTS (SELECT 1 FROM sessions s \
                 WHERE s.program_id = p.program_id AND s.end_time IS NULL)"
            } else {
                ""
            };
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM programs p {} ORDER BY p.program_id ASC",
                    PROGRAM_COLUMNS, filter
                ))
                .map_err(|err| format!("Failed to prepare programs query: {}", err))?;

            let rows = stmt
                .query_map([], |row| program_from_row(row, 0))
                .map_err(|err| format!("Failed to query programs: {}", err))?;

            let mut programs = Vec::new();
            for row in rows {
                programs.push(row.map_err(|err| format!("Failed to decode program row: {}", err))?);
            }
            Ok(programs)
        })
    }

    pub fn list_programs_with_sessions(
        &self,
        active_only: bool,
    ) -> Result<Vec<ProgramWithSessions>, String> {
        let programs = self.list_programs(active_only)?;
        self.with_connection(|conn| {
            let mut results = Vec::with_capacity(programs.len());
            for program in programs {
                let sessions = list_sessions(conn, program.program_id)?;
                results.push(ProgramWithSessions { program, sessions });
            }
            Ok(results)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS programs (
                    program_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    program_name TEXT NOT NULL UNIQUE,
                    first_seen TEXT NOT NULL,
                    owner_id INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    program_id INTEGER NOT NULL
                        REFERENCES programs(program_id) ON DELETE CASCADE,
                    start_time TEXT NOT NULL,
                    end_time TEXT,
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    session_number INTEGER NOT NULL,
                    UNIQUE (program_id, session_number)
                 );
                 CREATE INDEX IF NOT EXISTS sessions_open_idx
                    ON sessions (end_time) WHERE end_time IS NULL;
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| format!("Failed to enable foreign keys: {}", err))?;

        Ok(conn)
    }
}

fn list_sessions(conn: &Connection, program_id: i64) -> Result<Vec<Session>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM sessions s WHERE s.program_id = ?1 ORDER BY s.session_number ASC",
            SESSION_COLUMNS
        ))
        .map_err(|err| format!("Failed to prepare sessions query: {}", err))?;

    let rows = stmt
        .query_map(params![program_id], |row| session_from_row(row, 0))
        .map_err(|err| format!("Failed to query sessions: {}", err))?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
    }
    Ok(sessions)
}

fn session_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Session> {
    let end_time = match row.get::<_, Option<String>>(offset + 3)? {
        Some(raw) => Some(timestamp_column(raw, offset + 3)?),
        None => None,
    };

    Ok(Session {
        session_id: row.get(offset)?,
        program_id: row.get(offset + 1)?,
        start_time: timestamp_column(row.get(offset + 2)?, offset + 2)?,
        end_time,
        duration_ms: row.get(offset + 4)?,
        session_number: row.get(offset + 5)?,
    })
}

fn program_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Program> {
    Ok(Program {
        program_id: row.get(offset)?,
        program_name: row.get(offset + 1)?,
        first_seen: timestamp_column(row.get(offset + 2)?, offset + 2)?,
        owner_id: row.get(offset + 3)?,
    })
}

fn timestamp_column(raw: String, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_rfc3339(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid timestamp: {}", raw),
            )),
        )
    })
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
