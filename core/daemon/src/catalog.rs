//! Program catalog: display name to stable catalog entry.

use chrono::{DateTime, Utc};
use logit_daemon_protocol::{OwnerRole, Program};
use tracing::info;

use crate::db::Db;

/// Owner recorded on every program the monitor discovers.
pub const DISCOVERY_OWNER: OwnerRole = OwnerRole::System;

/// Looks up `display_name` by exact, case-sensitive match and creates the
/// entry on first sighting.
///
/// Duplicate rows cannot appear as long as lookups and inserts for one name
/// happen on the monitor thread only.
pub fn find_or_create(db: &Db, display_name: &str, now: DateTime<Utc>) -> Result<Program, String> {
    if let Some(program) = db.find_program_by_name(display_name)? {
        return Ok(program);
    }

    let program = db.insert_program(&Program {
        program_id: 0,
        program_name: display_name.to_string(),
        first_seen: now,
        owner_id: DISCOVERY_OWNER.owner_id(),
    })?;

    info!(
        program_id = program.program_id,
        program = %program.program_name,
        first_seen = %program.first_seen,
        "New program added to catalog"
    );

    Ok(program)
}
