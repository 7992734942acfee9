//! Logical session reconciliation
//!
//! Clients restart, crash and reconnect, so one human work session shows
//! up as several physical `session_id` values. Every incoming event gets a
//! `parent_session_id` computed from the database state visible at insert
//! time: session starts within four hours of the previous start by the
//! same `(user, server)` chain onto the same logical session, and
//! non-start events inherit whatever their physical session already
//! resolved to.
//!
//! The resolution is a pure function of stored rows plus the incoming
//! event and takes no locks. Two racing first-of-session events may each
//! pick themselves as parent; that grouping is valid, just not minimal.

use crate::db::{BackendKind, Sql, StorageTransaction};
use crate::error::Result;
use crate::sql_params;
use crate::types::{EventType, ParsedEvent};

/// Two session starts by the same (user, server) within this window belong
/// to the same logical session.
pub const SESSION_LINK_WINDOW_SECS: i64 = 4 * 60 * 60;

/// Most recent prior event of this physical session that already has a
/// parent. Tie-break is strictly timestamp DESC, id DESC.
const INHERITED_PARENT: Sql = Sql {
    sqlite: "SELECT parent_session_id FROM telemetry_events
             WHERE session_id = ?1 AND parent_session_id IS NOT NULL
             ORDER BY timestamp DESC, id DESC LIMIT 1",
    postgres: "SELECT parent_session_id FROM telemetry_events
               WHERE session_id = $1 AND parent_session_id IS NOT NULL
               ORDER BY timestamp DESC, id DESC LIMIT 1",
};

/// Most recent prior session_start of this physical session.
const PRIOR_START_FOR_SESSION: Sql = Sql {
    sqlite: "SELECT e.session_id, e.parent_session_id FROM telemetry_events e
             JOIN event_types et ON et.id = e.event_id
             WHERE e.session_id = ?1 AND et.name = 'session_start'
             ORDER BY e.timestamp DESC, e.id DESC LIMIT 1",
    postgres: "SELECT e.session_id, e.parent_session_id FROM telemetry_events e
               JOIN event_types et ON et.id = e.event_id
               WHERE e.session_id = $1 AND et.name = 'session_start'
               ORDER BY e.timestamp DESC, e.id DESC LIMIT 1",
};

/// Most recent prior session_start by the same (user, server).
const RECENT_START_FOR_USER: Sql = Sql {
    sqlite: "SELECT e.session_id, e.parent_session_id, e.timestamp FROM telemetry_events e
             JOIN event_types et ON et.id = e.event_id
             WHERE e.user_id = ?1 AND e.server_id = ?2 AND et.name = 'session_start'
             ORDER BY e.timestamp DESC, e.id DESC LIMIT 1",
    postgres: "SELECT e.session_id, e.parent_session_id, e.timestamp FROM telemetry_events e
               JOIN event_types et ON et.id = e.event_id
               WHERE e.user_id = $1 AND e.server_id = $2 AND et.name = 'session_start'
               ORDER BY e.timestamp DESC, e.id DESC LIMIT 1",
};

/// Compute the logical parent session for an incoming event.
///
/// Runs inside the ingest transaction so events earlier in the same batch
/// are visible.
pub fn resolve(
    tx: &mut dyn StorageTransaction,
    kind: BackendKind,
    event: &ParsedEvent,
) -> Result<Option<String>> {
    let Some(session_id) = event.session_id.as_deref() else {
        return Ok(None);
    };

    if event.event_type != EventType::SessionStart {
        if let Some(row) = tx.query_one(INHERITED_PARENT.for_kind(kind), &sql_params![session_id])? {
            return row.get_opt_str("parent_session_id");
        }

        if let Some(row) =
            tx.query_one(PRIOR_START_FOR_SESSION.for_kind(kind), &sql_params![session_id])?
        {
            let parent = row
                .get_opt_str("parent_session_id")?
                .or(row.get_opt_str("session_id")?);
            return Ok(parent);
        }

        // No history for this physical session: it is its own parent
        return Ok(Some(session_id.to_string()));
    }

    // session_start: chain onto the previous start of the same (user, server)
    // when it landed within the linking window
    let (Some(user_id), Some(server_id)) = (event.user_id.as_deref(), event.server_id.as_deref())
    else {
        return Ok(Some(session_id.to_string()));
    };

    if let Some(row) = tx.query_one(
        RECENT_START_FOR_USER.for_kind(kind),
        &sql_params![user_id, server_id],
    )? {
        if let Some(prior_ts) = row.get_opt_datetime("timestamp")? {
            let gap = (event.timestamp - prior_ts).num_seconds().abs();
            if gap <= SESSION_LINK_WINDOW_SECS {
                let parent = row
                    .get_opt_str("parent_session_id")?
                    .or(row.get_opt_str("session_id")?);
                return Ok(parent);
            }
        }
    }

    Ok(Some(session_id.to_string()))
}
