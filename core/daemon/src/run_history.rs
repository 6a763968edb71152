//! Run history: whether the previous daemon run stopped cleanly.
//!
//! Startup sets a `running_since` marker and a clean shutdown clears it, so a
//! marker still present at the next start means the previous run was killed
//! or crashed. The verdict is logged next to the Startup Repair results and
//! reported by the health endpoint. Repeated unclean starts inside
//! `RESTART_WINDOW_SECS` are flagged as a restart loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::repair::RepairStats;

const RESTART_WINDOW_SECS: i64 = 300;
const RESTART_LOOP_THRESHOLD: usize = 3;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunLog {
    #[serde(default)]
    running_since: Option<DateTime<Utc>>,
    #[serde(default)]
    last_clean_stop: Option<DateTime<Utc>>,
    #[serde(default)]
    unclean_starts: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviousRun {
    None,
    Clean,
    Unclean,
}

/// What the health endpoint reports about this start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub started_at: DateTime<Utc>,
    pub previous_run: PreviousRun,
    /// Unclean starts within the restart window, this one included.
    pub recent_unclean_starts: usize,
    pub restart_loop: bool,
    pub repair: Option<RepairStats>,
}

/// Marks this run as started and classifies the previous one.
pub fn record_start(path: &Path, now: DateTime<Utc>) -> Result<StartupReport, String> {
    let mut log = match load_log(path) {
        Ok(log) => log,
        Err(err) => {
            warn!(error = %err, "Discarding unreadable run history");
            RunLog::default()
        }
    };

    let previous_run = match (log.running_since, log.last_clean_stop) {
        (Some(_), _) => PreviousRun::Unclean,
        (None, Some(_)) => PreviousRun::Clean,
        (None, None) => PreviousRun::None,
    };

    log.unclean_starts
        .retain(|start| now.signed_duration_since(*start).num_seconds() <= RESTART_WINDOW_SECS);
    if previous_run == PreviousRun::Unclean {
        log.unclean_starts.push(now);
    }
    log.running_since = Some(now);
    save_log(path, &log)?;

    Ok(StartupReport {
        started_at: now,
        previous_run,
        recent_unclean_starts: log.unclean_starts.len(),
        restart_loop: log.unclean_starts.len() >= RESTART_LOOP_THRESHOLD,
        repair: None,
    })
}

/// Clears the running marker after the monitor stopped on request.
pub fn record_clean_stop(path: &Path, now: DateTime<Utc>) -> Result<(), String> {
    let mut log = load_log(path)?;
    log.running_since = None;
    log.last_clean_stop = Some(now);
    log.unclean_starts.clear();
    save_log(path, &log)
}

impl StartupReport {
    /// Whether open sessions found by repair are explained by a crash.
    pub fn repaired_after_crash(&self) -> bool {
        self.previous_run == PreviousRun::Unclean
            && self.repair.map(|stats| stats.repaired > 0).unwrap_or(false)
    }
}

fn load_log(path: &Path) -> Result<RunLog, String> {
    let data = match fs_err::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(RunLog::default()),
        Err(err) => return Err(format!("Failed to read run history: {}", err)),
    };

    serde_json::from_slice(&data).map_err(|err| format!("Failed to parse run history: {}", err))
}

fn save_log(path: &Path, log: &RunLog) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|err| format!("Failed to create run history dir: {}", err))?;
    }

    let payload = serde_json::to_vec_pretty(log)
        .map_err(|err| format!("Failed to serialize run history: {}", err))?;
    let tmp_path = path.with_extension("tmp");
    fs_err::write(&tmp_path, payload)
        .map_err(|err| format!("Failed to write run history: {}", err))?;
    fs_err::rename(&tmp_path, path).map_err(|err| format!("Failed to commit run history: {}", err))
}
