//! One reconciliation tick: sample, close, refresh, discover.
//!
//! Per tracked pid the state machine is `Untracked -> Open -> Closed`, and a
//! closed pid leaves the map. The closure pass runs before discovery so a pid
//! the OS hands to a new process is closed as the old session first and then
//! opened fresh.
//!
//! Only a failed sample aborts a tick. Store failures are counted per pid and
//! retried on the next tick, and a session whose row was deleted is dropped
//! from tracking.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog;
use crate::error::TickError;
use crate::ledger::{self, LedgerError};
use crate::sampler::{ProcessObservation, ProcessSampler};
use crate::state::{SharedState, TickReport, TrackedSession};

pub struct Reconciler<S> {
    state: Arc<SharedState>,
    sampler: S,
}

impl<S: ProcessSampler> Reconciler<S> {
    pub fn new(state: Arc<SharedState>, sampler: S) -> Self {
        Self { state, sampler }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, TickError> {
        let sample = self.sampler.sample().map_err(TickError::Sample)?;
        let mut report = TickReport {
            at: Some(now),
            sampled: sample.len(),
            ..TickReport::default()
        };

        let live: HashMap<u32, &ProcessObservation> = sample
            .iter()
            .map(|observation| (observation.pid, observation))
            .collect();

        for (pid, entry) in self.state.tracked_entries() {
            let still_running = live
                .get(&pid)
                .map(|observation| observation.same_process_as(entry.process_started_at))
                .unwrap_or(false);
            if still_running {
                continue;
            }
            if let Err(err) = self.close_vanished(pid, entry, now, &mut report) {
                record_failure(pid, &err, &mut report);
            }
        }

        for (pid, entry) in self.state.tracked_entries() {
            if let Err(err) = self.refresh_open(pid, entry, now, &mut report) {
                record_failure(pid, &err, &mut report);
            }
        }

        for observation in sample.iter().filter(|observation| observation.is_relevant) {
            report.relevant += 1;
            if let Err(err) = self.discover(observation, now, &mut report) {
                record_failure(observation.pid, &err, &mut report);
            }
        }

        Ok(report)
    }

    fn close_vanished(
        &self,
        pid: u32,
        entry: TrackedSession,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), TickError> {
        // Stays tracked until the close is persisted so a failed write is
        // retried on the next tick.
        let mut session = entry.session;
        if let Err(err) = ledger::close(self.state.db(), &mut session, now) {
            return self.ledger_failure(pid, err, report);
        }
        self.state.untrack(pid);
        report.closed += 1;

        info!(
            pid,
            program = %entry.program_name,
            session_id = session.session_id,
            session_number = session.session_number,
            duration_ms = session.duration_ms,
            "Session closed"
        );
        Ok(())
    }

    fn refresh_open(
        &self,
        pid: u32,
        entry: TrackedSession,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), TickError> {
        let mut session = entry.session;
        match ledger::touch(self.state.db(), &mut session, now) {
            Ok(true) => {
                self.state.update_tracked_session(pid, session);
                report.refreshed += 1;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => self.ledger_failure(pid, err, report),
        }
    }

    fn discover(
        &self,
        observation: &ProcessObservation,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), TickError> {
        let program = catalog::find_or_create(self.state.db(), &observation.display_name, now)
            .map_err(TickError::Store)?;
        if self.state.is_tracked(observation.pid) {
            return Ok(());
        }

        let session = ledger::open(self.state.db(), &program, now).map_err(TickError::Store)?;
        info!(
            pid = observation.pid,
            program = %program.program_name,
            session_id = session.session_id,
            session_number = session.session_number,
            start_time = %session.start_time,
            "Session opened"
        );
        self.state.track(
            observation.pid,
            TrackedSession {
                program_name: program.program_name,
                process_started_at: observation.started_at,
                session,
            },
        );
        report.opened += 1;
        Ok(())
    }

    /// A deleted row can never be written again, so its pid stops being
    /// tracked; any other store error is returned for a retry next tick.
    fn ledger_failure(
        &self,
        pid: u32,
        err: LedgerError,
        report: &mut TickReport,
    ) -> Result<(), TickError> {
        match err {
            LedgerError::SessionMissing(session_id) => {
                self.state.untrack(pid);
                report.dropped += 1;
                warn!(pid, session_id, "Tracked session row is gone; no longer tracking pid");
                Ok(())
            }
            LedgerError::Store(err) => Err(TickError::Store(err)),
        }
    }
}

fn record_failure(pid: u32, err: &TickError, report: &mut TickReport) {
    report.failed += 1;
    warn!(pid, kind = err.kind(), error = %err, "Tick step failed; retrying next tick");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::sampler::{classify, ProcessCandidate, RelevancePolicy};
    use chrono::{Duration, TimeZone};
    use std::collections::VecDeque;
    use std::path::PathBuf;

    struct ScriptedSampler {
        samples: VecDeque<Result<Vec<ProcessObservation>, String>>,
    }

    impl ScriptedSampler {
        fn new(samples: Vec<Result<Vec<ProcessObservation>, String>>) -> Self {
            Self {
                samples: samples.into(),
            }
        }
    }

    impl ProcessSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<Vec<ProcessObservation>, String> {
            self.samples
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string()))
        }
    }

    fn policy() -> RelevancePolicy {
        RelevancePolicy {
            require_visible_window: true,
            self_names: vec!["LogIt.UI".to_string()],
            system_dirs: vec![PathBuf::from("C:/Windows")],
        }
    }

    fn editor(pid: u32) -> ProcessCandidate {
        ProcessCandidate {
            pid,
            name: "Editor.exe".to_string(),
            exe: Some(PathBuf::from("C:/Apps/Editor.exe")),
            description: Some("Best Editor".to_string()),
            has_visible_window: true,
            started_at: Some(1_700_000_000),
        }
    }

    fn daemon(pid: u32) -> ProcessCandidate {
        ProcessCandidate {
            pid,
            name: "indexer".to_string(),
            exe: Some(PathBuf::from("C:/Apps/indexer.exe")),
            description: None,
            has_visible_window: false,
            started_at: Some(1_600_000_000),
        }
    }

    fn observe(candidates: &[ProcessCandidate]) -> Result<Vec<ProcessObservation>, String> {
        Ok(candidates
            .iter()
            .map(|candidate| classify(candidate, &policy()))
            .collect())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
    }

    fn setup(
        samples: Vec<Result<Vec<ProcessObservation>, String>>,
    ) -> (tempfile::TempDir, Reconciler<ScriptedSampler>) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("logit.db")).expect("db init");
        let state = Arc::new(SharedState::new(db));
        (temp_dir, Reconciler::new(state, ScriptedSampler::new(samples)))
    }

    fn sessions_of(
        reconciler: &Reconciler<ScriptedSampler>,
        name: &str,
    ) -> Vec<logit_daemon_protocol::Session> {
        let db = reconciler.state().db();
        let program = db
            .find_program_by_name(name)
            .expect("query")
            .expect("program exists");
        db.list_sessions_for_program(program.program_id)
            .expect("sessions")
    }

    #[test]
    fn first_sighting_creates_program_and_open_session() {
        let (_dir, mut reconciler) = setup(vec![observe(&[editor(4242)])]);

        let report = reconciler.tick(t0()).expect("tick");
        assert_eq!(report.opened, 1);
        assert_eq!(report.relevant, 1);

        let programs = reconciler.state().db().list_programs(false).expect("programs");
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].program_name, "Best Editor");

        let sessions = sessions_of(&reconciler, "Best Editor");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_number, 1);
        assert_eq!(sessions[0].end_time, None);
        assert!(reconciler.state().is_tracked(4242));
    }

    #[test]
    fn vanished_process_closes_with_elapsed_duration() {
        let (_dir, mut reconciler) = setup(vec![observe(&[editor(4242)]), observe(&[])]);

        reconciler.tick(t0()).expect("first tick");
        let report = reconciler
            .tick(t0() + Duration::seconds(1))
            .expect("second tick");
        assert_eq!(report.closed, 1);

        let sessions = sessions_of(&reconciler, "Best Editor");
        assert_eq!(sessions[0].end_time, Some(t0() + Duration::seconds(1)));
        assert_eq!(sessions[0].duration_ms, 1_000);
        assert!(!reconciler.state().is_tracked(4242));
    }

    #[test]
    fn running_process_refreshes_duration() {
        let (_dir, mut reconciler) = setup(vec![
            observe(&[editor(4242)]),
            observe(&[editor(4242)]),
            observe(&[editor(4242)]),
        ]);

        reconciler.tick(t0()).expect("tick 1");
        let report = reconciler.tick(t0() + Duration::seconds(1)).expect("tick 2");
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.opened, 0);
        reconciler.tick(t0() + Duration::seconds(2)).expect("tick 3");

        let sessions = sessions_of(&reconciler, "Best Editor");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration_ms, 2_000);
        assert!(sessions[0].is_open());
    }

    #[test]
    fn background_process_never_produces_records() {
        let (_dir, mut reconciler) = setup(vec![
            observe(&[daemon(77)]),
            observe(&[daemon(77)]),
            observe(&[daemon(77)]),
        ]);

        for second in 0..3 {
            let report = reconciler
                .tick(t0() + Duration::seconds(second))
                .expect("tick");
            assert_eq!(report.opened, 0);
        }
        assert!(reconciler.state().db().list_programs(false).expect("programs").is_empty());
        assert_eq!(reconciler.state().open_session_count(), 0);
    }

    #[test]
    fn own_companion_ui_is_never_tracked() {
        let mut ui = editor(900);
        ui.name = "LogIt.UI.exe".to_string();
        ui.description = Some("LogIt.UI".to_string());
        let (_dir, mut reconciler) = setup(vec![observe(&[ui.clone()]), observe(&[ui])]);

        reconciler.tick(t0()).expect("tick 1");
        reconciler.tick(t0() + Duration::seconds(1)).expect("tick 2");
        assert!(reconciler.state().db().list_programs(false).expect("programs").is_empty());
    }

    #[test]
    fn reappearing_pid_gets_a_new_numbered_session() {
        let (_dir, mut reconciler) = setup(vec![
            observe(&[editor(4242)]),
            observe(&[]),
            observe(&[editor(4242)]),
        ]);

        reconciler.tick(t0()).expect("tick 1");
        reconciler.tick(t0() + Duration::seconds(5)).expect("tick 2");
        reconciler.tick(t0() + Duration::seconds(9)).expect("tick 3");

        let sessions = sessions_of(&reconciler, "Best Editor");
        let numbers: Vec<u32> = sessions.iter().map(|session| session.session_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(!sessions[0].is_open());
        assert!(sessions[1].is_open());
        assert_eq!(sessions[1].start_time, t0() + Duration::seconds(9));
    }

    #[test]
    fn pid_reused_between_ticks_closes_old_session_first() {
        let mut successor = editor(4242);
        successor.started_at = Some(1_700_000_500);
        let (_dir, mut reconciler) = setup(vec![observe(&[editor(4242)]), observe(&[successor])]);

        reconciler.tick(t0()).expect("tick 1");
        let report = reconciler.tick(t0() + Duration::seconds(1)).expect("tick 2");
        assert_eq!(report.closed, 1);
        assert_eq!(report.opened, 1);

        let sessions = sessions_of(&reconciler, "Best Editor");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].end_time, Some(t0() + Duration::seconds(1)));
        assert!(sessions[1].is_open());
        assert_eq!(
            reconciler.state().tracked_entries()[0].1.process_started_at,
            Some(1_700_000_500)
        );
    }

    #[test]
    fn concurrent_processes_of_one_program_get_their_own_sessions() {
        let (_dir, mut reconciler) = setup(vec![observe(&[editor(1), editor(2)])]);

        let report = reconciler.tick(t0()).expect("tick");
        assert_eq!(report.opened, 2);
        assert_eq!(reconciler.state().db().list_programs(false).expect("programs").len(), 1);

        let numbers: Vec<u32> = sessions_of(&reconciler, "Best Editor")
            .iter()
            .map(|session| session.session_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn failed_sample_keeps_tracking_untouched() {
        let (_dir, mut reconciler) = setup(vec![
            observe(&[editor(4242)]),
            Err("process table unavailable".to_string()),
            observe(&[editor(4242)]),
        ]);

        reconciler.tick(t0()).expect("tick 1");
        let err = reconciler
            .tick(t0() + Duration::seconds(1))
            .expect_err("sample failure");
        assert!(matches!(err, TickError::Sample(_)));
        assert!(reconciler.state().is_tracked(4242));

        let report = reconciler.tick(t0() + Duration::seconds(2)).expect("tick 3");
        assert_eq!(report.opened, 0);
        assert_eq!(sessions_of(&reconciler, "Best Editor").len(), 1);
    }

    #[test]
    fn failed_close_is_retried_on_next_tick() {
        let (dir, mut reconciler) =
            setup(vec![observe(&[editor(4242)]), observe(&[]), observe(&[])]);
        reconciler.tick(t0()).expect("tick 1");

        let db_path = dir.path().join("logit.db");
        let conn = rusqlite::Connection::open(&db_path).expect("open raw db");
        conn.execute("ALTER TABLE sessions RENAME TO sessions_offline", [])
            .expect("take sessions offline");

        let report = reconciler
            .tick(t0() + Duration::seconds(1))
            .expect("tick completes");
        assert_eq!(report.failed, 1);
        assert_eq!(report.closed, 0);
        assert!(reconciler.state().is_tracked(4242));

        conn.execute("ALTER TABLE sessions_offline RENAME TO sessions", [])
            .expect("restore sessions");
        let report = reconciler.tick(t0() + Duration::seconds(2)).expect("tick 3");
        assert_eq!(report.closed, 1);
        assert_eq!(report.failed, 0);
        assert!(!reconciler.state().is_tracked(4242));

        let sessions = sessions_of(&reconciler, "Best Editor");
        assert_eq!(sessions[0].end_time, Some(t0() + Duration::seconds(2)));
    }

    #[test]
    fn deleted_session_row_does_not_stall_discovery() {
        let mut browser = editor(2);
        browser.name = "browser".to_string();
        browser.description = Some("Browser".to_string());
        let (dir, mut reconciler) = setup(vec![
            observe(&[editor(1)]),
            observe(&[editor(1), browser.clone()]),
            observe(&[editor(1), browser]),
        ]);
        reconciler.tick(t0()).expect("tick 1");

        let conn = rusqlite::Connection::open(dir.path().join("logit.db")).expect("open raw db");
        conn.execute("DELETE FROM sessions", []).expect("delete sessions");

        let report = reconciler
            .tick(t0() + Duration::seconds(1))
            .expect("tick 2");
        assert_eq!(report.dropped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.opened, 2);
        assert!(reconciler.state().is_tracked(1));
        assert!(reconciler.state().is_tracked(2));
        assert_eq!(sessions_of(&reconciler, "Browser").len(), 1);

        let report = reconciler
            .tick(t0() + Duration::seconds(2))
            .expect("tick 3");
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(sessions_of(&reconciler, "Best Editor")[0].duration_ms, 1_000);
    }
}
