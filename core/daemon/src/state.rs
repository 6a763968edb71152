//! State shared between the monitor thread and socket handlers.
//!
//! The tracked-process map is written only by the monitor thread; handlers
//! and the shutdown path read it through snapshots without pausing the loop.

use chrono::{DateTime, Utc};
use logit_daemon_protocol::{
    AppendSessionParams, ProgramWithSessions, Session, TrackedProcess,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::db::Db;
use crate::ledger;

/// Open session the monitor is keeping alive for one pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSession {
    pub program_name: String,
    /// Start time of the OS process when it was first seen.
    pub process_started_at: Option<u64>,
    pub session: Session,
}

/// Counters for one completed reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub at: Option<DateTime<Utc>>,
    pub sampled: usize,
    pub relevant: usize,
    pub opened: usize,
    pub closed: usize,
    pub refreshed: usize,
    /// Pids dropped because their session row no longer exists.
    pub dropped: usize,
    /// Per-pid store failures, retried on the next tick.
    pub failed: usize,
}

pub struct SharedState {
    db: Db,
    tracked: Mutex<HashMap<u32, TrackedSession>>,
    last_tick: Mutex<Option<TickReport>>,
}

impl SharedState {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            tracked: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(None),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn tracked_entries(&self) -> Vec<(u32, TrackedSession)> {
        let tracked = self.lock_tracked();
        let mut entries: Vec<_> = tracked
            .iter()
            .map(|(pid, entry)| (*pid, entry.clone()))
            .collect();
        entries.sort_by_key(|(pid, _)| *pid);
        entries
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.lock_tracked().contains_key(&pid)
    }

    pub fn track(&self, pid: u32, entry: TrackedSession) {
        self.lock_tracked().insert(pid, entry);
    }

    pub fn untrack(&self, pid: u32) -> Option<TrackedSession> {
        self.lock_tracked().remove(&pid)
    }

    pub fn update_tracked_session(&self, pid: u32, session: Session) {
        if let Some(entry) = self.lock_tracked().get_mut(&pid) {
            entry.session = session;
        }
    }

    pub fn open_session_count(&self) -> usize {
        self.lock_tracked().len()
    }

    pub fn record_tick(&self, report: TickReport) {
        if let Ok(mut last_tick) = self.last_tick.lock() {
            *last_tick = Some(report);
        }
    }

    pub fn last_tick(&self) -> Option<TickReport> {
        self.last_tick
            .lock()
            .map(|last_tick| last_tick.clone())
            .unwrap_or_default()
    }

    pub fn tracked_snapshot(&self) -> Vec<TrackedProcess> {
        self.tracked_entries()
            .into_iter()
            .map(|(pid, entry)| TrackedProcess {
                pid,
                program_name: entry.program_name,
                session: entry.session,
            })
            .collect()
    }

    pub fn programs_snapshot(&self, active_only: bool) -> Result<Vec<ProgramWithSessions>, String> {
        self.db.list_programs_with_sessions(active_only)
    }

    /// Sessions of one program, or `None` when the program does not exist.
    pub fn program_sessions_snapshot(
        &self,
        program_id: i64,
    ) -> Result<Option<Vec<Session>>, String> {
        if self.db.get_program(program_id)?.is_none() {
            return Ok(None);
        }
        self.db.list_sessions_for_program(program_id).map(Some)
    }

    pub fn append_session(&self, params: &AppendSessionParams) -> Result<Option<Session>, String> {
        let appended = ledger::append(&self.db, params)?;
        if let Some(session) = appended.as_ref() {
            tracing::info!(
                program_id = session.program_id,
                session_id = session.session_id,
                session_number = session.session_number,
                "Session appended via socket"
            );
        }
        Ok(appended)
    }

    fn lock_tracked(&self) -> MutexGuard<'_, HashMap<u32, TrackedSession>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
