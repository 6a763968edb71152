//! Session ledger: numbered start/end/duration records per program.
//!
//! Durations are whole milliseconds. A closed session always satisfies
//! `end_time - start_time == duration_ms`, and neither the live refresh nor
//! the close ever lowers a stored duration.

use chrono::{DateTime, Duration, Utc};
use logit_daemon_protocol::{AppendSessionParams, Program, Session};

use crate::db::Db;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The row was deleted underneath a live session.
    #[error("session {0} no longer exists")]
    SessionMissing(i64),

    #[error("{0}")]
    Store(String),
}

impl From<String> for LedgerError {
    fn from(err: String) -> Self {
        LedgerError::Store(err)
    }
}

/// Opens session `count + 1` for `program`, started at `now`.
pub fn open(db: &Db, program: &Program, now: DateTime<Utc>) -> Result<Session, String> {
    let session_number = db.count_sessions(program.program_id)? + 1;
    db.insert_session(&Session {
        session_id: 0,
        program_id: program.program_id,
        start_time: now,
        end_time: None,
        duration_ms: 0,
        session_number,
    })
}

/// Refreshes the running duration. Returns whether a write happened; the row
/// is only rewritten when the duration actually grew.
pub fn touch(db: &Db, session: &mut Session, now: DateTime<Utc>) -> Result<bool, LedgerError> {
    let elapsed = elapsed_ms(session.start_time, now);
    if elapsed <= session.duration_ms {
        return Ok(false);
    }

    let refreshed = Session {
        duration_ms: elapsed,
        ..session.clone()
    };
    persist(db, &refreshed)?;
    *session = refreshed;
    Ok(true)
}

/// Closes a live session at `now`.
pub fn close(db: &Db, session: &mut Session, now: DateTime<Utc>) -> Result<(), LedgerError> {
    if !session.is_open() {
        return Ok(());
    }
    let closed = closed_at(session, now);
    persist(db, &closed)?;
    *session = closed;
    Ok(())
}

/// Closes a session left open by a previous run, reconstructing its end from
/// the last persisted duration.
pub fn close_stale(db: &Db, session: &mut Session) -> Result<(), LedgerError> {
    let closed = stale_closed(session);
    persist(db, &closed)?;
    *session = closed;
    Ok(())
}

/// Appends a manually recorded session. Returns `None` when the program does
/// not exist.
pub fn append(db: &Db, params: &AppendSessionParams) -> Result<Option<Session>, String> {
    let Some(program) = db.get_program(params.program_id)? else {
        return Ok(None);
    };

    let session_number = db.count_sessions(program.program_id)? + 1;
    db.insert_session(&Session {
        session_id: 0,
        program_id: program.program_id,
        start_time: params.start_time,
        end_time: params.end_time,
        duration_ms: params.effective_duration_ms(),
        session_number,
    })
    .map(Some)
}

fn persist(db: &Db, session: &Session) -> Result<(), LedgerError> {
    if db.update_session(session)? {
        Ok(())
    } else {
        Err(LedgerError::SessionMissing(session.session_id))
    }
}

fn closed_at(session: &Session, now: DateTime<Utc>) -> Session {
    // A clock step backwards must not shrink the recorded duration.
    let earliest_end = session.start_time + session.duration();
    let end_time = if now > earliest_end { now } else { earliest_end };

    Session {
        end_time: Some(end_time),
        duration_ms: elapsed_ms(session.start_time, end_time),
        ..session.clone()
    }
}

fn stale_closed(session: &Session) -> Session {
    let (end_time, duration_ms) = if session.duration_ms > 0 {
        (
            session.start_time + Duration::milliseconds(session.duration_ms),
            session.duration_ms,
        )
    } else {
        (session.start_time, 0)
    };

    Session {
        end_time: Some(end_time),
        duration_ms,
        ..session.clone()
    }
}

fn elapsed_ms(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(start).num_milliseconds().max(0)
}
