//! The trash: soft delete, recovery and permanent purging
//!
//! Soft delete only stamps `deleted_at`; the row, its payload and its
//! aggregate contributions stay intact so the operation is a reversible
//! undo buffer. Counters are only repaired when rows are permanently
//! removed.

use super::events::row_to_event;
use super::{Database, QueryBuilder, Sql};
use crate::error::Result;
use crate::sql_params;
use crate::types::TelemetryEvent;
use chrono::Utc;

/// Default age threshold for [`Database::cleanup_old_deleted_events`].
pub const DEFAULT_TRASH_RETENTION_DAYS: i64 = 30;

const TRASH_PAGE_CAP: usize = 1000;

const SOFT_DELETE_BY_ID: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
    postgres: "UPDATE telemetry_events SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL",
};

const SOFT_DELETE_ALL: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET deleted_at = ?1 WHERE deleted_at IS NULL",
    postgres: "UPDATE telemetry_events SET deleted_at = $1 WHERE deleted_at IS NULL",
};

const SOFT_DELETE_BY_SESSION: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET deleted_at = ?2
             WHERE deleted_at IS NULL
               AND (parent_session_id = ?1 OR (parent_session_id IS NULL AND session_id = ?1))",
    postgres: "UPDATE telemetry_events SET deleted_at = $2
               WHERE deleted_at IS NULL
                 AND (parent_session_id = $1 OR (parent_session_id IS NULL AND session_id = $1))",
};

const SOFT_DELETE_PSEUDO_SESSION: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET deleted_at = ?3
             WHERE deleted_at IS NULL
               AND session_id IS NULL AND parent_session_id IS NULL
               AND user_id = ?1
               AND strftime('%Y-%m-%d', timestamp) = ?2",
    postgres: "UPDATE telemetry_events SET deleted_at = $3
               WHERE deleted_at IS NULL
                 AND session_id IS NULL AND parent_session_id IS NULL
                 AND user_id = $1
                 AND to_char(timestamp AT TIME ZONE 'UTC', 'YYYY-MM-DD') = $2",
};

const RECOVER_BY_ID: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET deleted_at = NULL WHERE id = ?1 AND deleted_at IS NOT NULL",
    postgres: "UPDATE telemetry_events SET deleted_at = NULL WHERE id = $1 AND deleted_at IS NOT NULL",
};

const TRASHED_KEYS_BY_ID: Sql = Sql {
    sqlite: "SELECT user_id, org_id FROM telemetry_events WHERE id = ?1 AND deleted_at IS NOT NULL",
    postgres: "SELECT user_id, org_id FROM telemetry_events WHERE id = $1 AND deleted_at IS NOT NULL",
};

const HARD_DELETE_BY_ID: Sql = Sql {
    sqlite: "DELETE FROM telemetry_events WHERE id = ?1 AND deleted_at IS NOT NULL",
    postgres: "DELETE FROM telemetry_events WHERE id = $1 AND deleted_at IS NOT NULL",
};

/// Parse a synthetic `user_<userId>_<YYYY-MM-DD>` session id. The user id
/// may itself contain underscores, so the date is taken from the right.
fn parse_pseudo_session(session_id: &str) -> Option<(&str, &str)> {
    let rest = session_id.strip_prefix("user_")?;
    let (user_id, date) = rest.rsplit_once('_')?;
    if user_id.is_empty() || date.len() != 10 {
        return None;
    }
    let mut chars = date.chars();
    let ok = chars.by_ref().take(4).all(|c| c.is_ascii_digit())
        && chars.next() == Some('-')
        && chars.by_ref().take(2).all(|c| c.is_ascii_digit())
        && chars.next() == Some('-')
        && chars.by_ref().take(2).all(|c| c.is_ascii_digit());
    ok.then_some((user_id, date))
}

impl Database {
    /// Move one live event to the trash. Returns false when the event does
    /// not exist or is already trashed.
    pub fn delete_event(&self, id: i64) -> Result<bool> {
        let affected = self.execute(&SOFT_DELETE_BY_ID, &sql_params![id, Utc::now()])?;
        Ok(affected > 0)
    }

    /// Move every live event to the trash. Returns the number of rows
    /// affected.
    pub fn delete_all_events(&self) -> Result<u64> {
        self.execute(&SOFT_DELETE_ALL, &sql_params![Utc::now()])
    }

    /// Move all live events of a logical session to the trash.
    ///
    /// Synthetic `user_<id>_<date>` sessions match the session-less events
    /// of that user on that UTC day. Repeating the call is a no-op.
    pub fn delete_events_by_session(&self, session_id: &str) -> Result<u64> {
        if let Some((user_id, date)) = parse_pseudo_session(session_id) {
            return self.execute(
                &SOFT_DELETE_PSEUDO_SESSION,
                &sql_params![user_id, date, Utc::now()],
            );
        }
        self.execute(&SOFT_DELETE_BY_SESSION, &sql_params![session_id, Utc::now()])
    }

    /// Pull one event back out of the trash. Returns false unless the
    /// event was actually trashed.
    pub fn recover_event(&self, id: i64) -> Result<bool> {
        let affected = self.execute(&RECOVER_BY_ID, &sql_params![id])?;
        Ok(affected > 0)
    }

    /// Irreversibly delete one trashed event, then repair the counters of
    /// the affected user and org.
    pub fn permanently_delete_event(&self, id: i64) -> Result<bool> {
        let Some(row) = self.query_one(&TRASHED_KEYS_BY_ID, &sql_params![id])? else {
            return Ok(false);
        };
        let user_id = row.get_opt_str("user_id")?;
        let org_id = row.get_opt_str("org_id")?;

        let affected = self.execute(&HARD_DELETE_BY_ID, &sql_params![id])?;
        if affected == 0 {
            return Ok(false);
        }

        if let Some(user_id) = user_id {
            self.recompute_user_event_stats(&[user_id])?;
        }
        if let Some(org_id) = org_id {
            self.recompute_org_event_stats(&[org_id])?;
        }
        Ok(true)
    }

    /// Hard-delete every trashed event and repair all affected counters.
    pub fn empty_trash(&self) -> Result<u64> {
        self.purge_trash(None)
    }

    /// Hard-delete trashed events older than `days_old` days (by their
    /// `deleted_at` stamp) and repair all affected counters.
    pub fn cleanup_old_deleted_events(&self, days_old: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days_old.max(0));
        self.purge_trash(Some(cutoff))
    }

    fn purge_trash(&self, older_than: Option<chrono::DateTime<Utc>>) -> Result<u64> {
        // Collect the keys whose counters will need repair before the rows
        // disappear
        let mut qb = QueryBuilder::new(
            self.kind(),
            "SELECT DISTINCT user_id, org_id FROM telemetry_events WHERE deleted_at IS NOT NULL",
        );
        if let Some(cutoff) = older_than {
            qb.push(" AND deleted_at <= ");
            let p = qb.bind(cutoff);
            qb.push(&p);
        }
        let (sql, params) = qb.finish();
        let rows = self.backend()?.query(&sql, &params)?;

        let mut users: Vec<String> = Vec::new();
        let mut orgs: Vec<String> = Vec::new();
        for row in &rows {
            if let Some(user_id) = row.get_opt_str("user_id")? {
                if !users.contains(&user_id) {
                    users.push(user_id);
                }
            }
            if let Some(org_id) = row.get_opt_str("org_id")? {
                if !orgs.contains(&org_id) {
                    orgs.push(org_id);
                }
            }
        }

        let mut qb = QueryBuilder::new(
            self.kind(),
            "DELETE FROM telemetry_events WHERE deleted_at IS NOT NULL",
        );
        if let Some(cutoff) = older_than {
            qb.push(" AND deleted_at <= ");
            let p = qb.bind(cutoff);
            qb.push(&p);
        }
        let (sql, params) = qb.finish();
        let purged = self.backend()?.execute(&sql, &params)?;

        if purged > 0 {
            tracing::info!(purged, users = users.len(), orgs = orgs.len(), "Emptied trash");
        }

        self.recompute_user_event_stats(&users)?;
        self.recompute_org_event_stats(&orgs)?;
        Ok(purged)
    }

    /// Paginated listing of trashed rows, most recently deleted first.
    /// The page size is capped at 1000.
    pub fn get_deleted_events(&self, limit: usize, offset: usize) -> Result<Vec<TelemetryEvent>> {
        let limit = limit.clamp(1, TRASH_PAGE_CAP);
        let statement = Sql {
            sqlite: "SELECT e.id, et.name AS event_type, e.area, e.timestamp, e.server_id,
                            e.version, e.session_id, e.parent_session_id, e.user_id, e.data,
                            e.received_at, e.created_at, e.org_id, e.user_name, e.tool_name,
                            e.company_name, e.error_message, e.team_id, e.deleted_at, e.success,
                            e.telemetry_schema_version
                     FROM telemetry_events e
                     JOIN event_types et ON et.id = e.event_id
                     WHERE e.deleted_at IS NOT NULL
                     ORDER BY e.deleted_at DESC, e.id DESC
                     LIMIT ?1 OFFSET ?2",
            postgres: "SELECT e.id, et.name AS event_type, e.area, e.timestamp, e.server_id,
                              e.version, e.session_id, e.parent_session_id, e.user_id, e.data,
                              e.received_at, e.created_at, e.org_id, e.user_name, e.tool_name,
                              e.company_name, e.error_message, e.team_id, e.deleted_at, e.success,
                              e.telemetry_schema_version
                       FROM telemetry_events e
                       JOIN event_types et ON et.id = e.event_id
                       WHERE e.deleted_at IS NOT NULL
                       ORDER BY e.deleted_at DESC, e.id DESC
                       LIMIT $1 OFFSET $2",
        };
        let rows = self.query(&statement, &sql_params![limit, offset])?;
        rows.iter().map(row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_support::open_test_db;
    use crate::ingest::{IngestOutcome, Ingestor};
    use serde_json::json;

    fn ingest_one(ingestor: &Ingestor, payload: serde_json::Value) -> i64 {
        match ingestor.ingest(&payload).unwrap() {
            IngestOutcome::Stored { id, .. } => id,
            other => panic!("expected stored event, got {:?}", other),
        }
    }

    fn setup(dir: &std::path::Path) -> (Database, Ingestor) {
        let db = open_test_db(dir);
        let ingestor = Ingestor::new(db.clone(), &Config::default());
        (db, ingestor)
    }

    #[test]
    fn test_parse_pseudo_session() {
        assert_eq!(
            parse_pseudo_session("user_u1_2025-01-15"),
            Some(("u1", "2025-01-15"))
        );
        // user ids may contain underscores
        assert_eq!(
            parse_pseudo_session("user_jane_doe_2025-01-15"),
            Some(("jane_doe", "2025-01-15"))
        );
        assert_eq!(parse_pseudo_session("s1"), None);
        assert_eq!(parse_pseudo_session("user__2025-01-15"), None);
        assert_eq!(parse_pseudo_session("user_u1_someday"), None);
    }

    #[test]
    fn test_soft_delete_and_recover_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ingestor) = setup(dir.path());

        let id = ingest_one(
            &ingestor,
            json!({
                "event": "tool_call", "userId": "u1", "serverId": "o",
                "timestamp": "2025-01-01T09:00:00Z", "data": {"toolName": "t"}
            }),
        );

        let before = db.get_event(id).unwrap().unwrap();

        assert!(db.delete_event(id).unwrap());
        // already trashed: second delete is a no-op
        assert!(!db.delete_event(id).unwrap());

        // invisible to default reads
        let page = db.get_events(&Default::default()).unwrap();
        assert!(page.events.is_empty());

        assert!(db.recover_event(id).unwrap());
        assert!(!db.recover_event(id).unwrap());

        let after = db.get_event(id).unwrap().unwrap();
        assert_eq!(after.data, before.data);
        assert_eq!(after.timestamp, before.timestamp);
        assert!(after.deleted_at.is_none());
    }

    #[test]
    fn test_delete_by_session_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ingestor) = setup(dir.path());

        ingest_one(
            &ingestor,
            json!({
                "event": "session_start", "sessionId": "s1", "userId": "u", "serverId": "o",
                "timestamp": "2025-01-01T09:00:00Z", "data": {}
            }),
        );
        ingest_one(
            &ingestor,
            json!({
                "event": "tool_call", "sessionId": "s1", "userId": "u", "serverId": "o",
                "timestamp": "2025-01-01T09:05:00Z", "data": {}
            }),
        );

        let user_count_before = db.get_user_event_stat("u").unwrap().unwrap().count;

        assert_eq!(db.delete_events_by_session("s1").unwrap(), 2);
        // second call finds nothing live: returns 0, counters unchanged
        assert_eq!(db.delete_events_by_session("s1").unwrap(), 0);
        assert_eq!(
            db.get_user_event_stat("u").unwrap().unwrap().count,
            user_count_before
        );
    }

    #[test]
    fn test_delete_pseudo_session() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ingestor) = setup(dir.path());

        ingest_one(
            &ingestor,
            json!({
                "event": "tool_call", "userId": "u1", "serverId": "o",
                "timestamp": "2025-01-15T09:00:00Z", "data": {}
            }),
        );
        // other day, untouched
        ingest_one(
            &ingestor,
            json!({
                "event": "tool_call", "userId": "u1", "serverId": "o",
                "timestamp": "2025-01-16T09:00:00Z", "data": {}
            }),
        );

        assert_eq!(db.delete_events_by_session("user_u1_2025-01-15").unwrap(), 1);
        let page = db.get_events(&Default::default()).unwrap();
        assert_eq!(page.events.len(), 1);
    }

    #[test]
    fn test_permanent_delete_repairs_counters() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ingestor) = setup(dir.path());

        let id = ingest_one(
            &ingestor,
            json!({
                "event": "tool_call", "userId": "u1", "serverId": "o",
                "timestamp": "2025-01-01T09:00:00Z", "data": {"orgId": "org-1"}
            }),
        );

        // not trashed yet: refused
        assert!(!db.permanently_delete_event(id).unwrap());

        db.delete_event(id).unwrap();
        // soft delete does not touch counters
        assert_eq!(db.get_user_event_stat("u1").unwrap().unwrap().count, 1);

        assert!(db.permanently_delete_event(id).unwrap());
        assert!(db.get_user_event_stat("u1").unwrap().is_none());
        assert!(db.get_org_event_stat("org-1").unwrap().is_none());
    }

    #[test]
    fn test_empty_trash_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ingestor) = setup(dir.path());

        for i in 0..3 {
            let id = ingest_one(
                &ingestor,
                json!({
                    "event": "tool_call", "userId": "u1", "serverId": "o",
                    "timestamp": format!("2025-01-01T09:0{}:00Z", i), "data": {}
                }),
            );
            if i < 2 {
                db.delete_event(id).unwrap();
            }
        }

        let trash = db.get_deleted_events(100, 0).unwrap();
        assert_eq!(trash.len(), 2);
        assert!(trash.iter().all(|e| e.deleted_at.is_some()));

        assert_eq!(db.empty_trash().unwrap(), 2);
        assert!(db.get_deleted_events(100, 0).unwrap().is_empty());
        // one live event remains and the counter now reflects it
        assert_eq!(db.get_user_event_stat("u1").unwrap().unwrap().count, 1);
    }

    #[test]
    fn test_cleanup_old_deleted_events_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ingestor) = setup(dir.path());

        let id = ingest_one(
            &ingestor,
            json!({
                "event": "tool_call", "userId": "u1", "serverId": "o",
                "timestamp": "2025-01-01T09:00:00Z", "data": {}
            }),
        );
        db.delete_event(id).unwrap();

        // freshly deleted: a 30-day purge must not touch it
        assert_eq!(
            db.cleanup_old_deleted_events(DEFAULT_TRASH_RETENTION_DAYS).unwrap(),
            0
        );
        assert_eq!(db.get_deleted_events(10, 0).unwrap().len(), 1);

        // a zero-day threshold purges everything already in the trash
        assert_eq!(db.cleanup_old_deleted_events(0).unwrap(), 1);
    }
}
