//! Startup repair for sessions a previous run left open.
//!
//! Runs once, before the monitor starts, so no live session can be mistaken
//! for a stale one. A session whose repair fails stays open and is retried on
//! the next start.

use serde::Serialize;
use tracing::{info, warn};

use crate::db::Db;
use crate::ledger;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    pub repaired: usize,
    pub failed: usize,
}

pub fn repair_open_sessions(db: &Db) -> Result<RepairStats, String> {
    let open = db.query_open_sessions()?;
    let mut stats = RepairStats::default();
    if open.is_empty() {
        return Ok(stats);
    }

    warn!(
        count = open.len(),
        "Found sessions left open by a previous run; closing them"
    );

    for entry in open {
        let mut session = entry.session;
        match ledger::close_stale(db, &mut session) {
            Ok(()) => {
                stats.repaired += 1;
                info!(
                    program = %entry.program.program_name,
                    session_id = session.session_id,
                    session_number = session.session_number,
                    duration_ms = session.duration_ms,
                    "Closed stale session"
                );
            }
            Err(err) => {
                stats.failed += 1;
                warn!(
                    error = %err,
                    program = %entry.program.program_name,
                    session_id = session.session_id,
                    "Failed to close stale session"
                );
            }
        }
    }

    Ok(stats)
}
