//! Per-user and per-org aggregate counters
//!
//! `user_event_stats` and `org_event_stats` are rollups of the fact table
//! kept current by ingest-time increments. Increments are a single atomic
//! conflict-update so concurrent ingests never lose a count. Ingest never
//! decrements; only permanent deletion triggers `recompute`, which is the
//! authoritative repair path. Soft-deleted events intentionally stay in
//! the counters until purged — the trash is an undo buffer, not a logical
//! delete.

use super::{Database, Sql};
use crate::error::Result;
use crate::sql_params;
use crate::types::EventStat;
use chrono::{DateTime, Utc};

const INCR_USER: Sql = Sql {
    sqlite: "INSERT INTO user_event_stats (user_id, count, last_event, display_name)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 count = user_event_stats.count + excluded.count,
                 last_event = CASE
                     WHEN user_event_stats.last_event IS NULL
                       OR excluded.last_event > user_event_stats.last_event
                     THEN excluded.last_event
                     ELSE user_event_stats.last_event
                 END,
                 display_name = COALESCE(user_event_stats.display_name, excluded.display_name)",
    postgres: "INSERT INTO user_event_stats (user_id, count, last_event, display_name)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (user_id) DO UPDATE SET
                   count = user_event_stats.count + excluded.count,
                   last_event = GREATEST(user_event_stats.last_event, excluded.last_event),
                   display_name = COALESCE(user_event_stats.display_name, excluded.display_name)",
};

const INCR_ORG: Sql = Sql {
    sqlite: "INSERT INTO org_event_stats (org_id, count, last_event)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(org_id) DO UPDATE SET
                 count = org_event_stats.count + excluded.count,
                 last_event = CASE
                     WHEN org_event_stats.last_event IS NULL
                       OR excluded.last_event > org_event_stats.last_event
                     THEN excluded.last_event
                     ELSE org_event_stats.last_event
                 END",
    postgres: "INSERT INTO org_event_stats (org_id, count, last_event)
               VALUES ($1, $2, $3)
               ON CONFLICT (org_id) DO UPDATE SET
                   count = org_event_stats.count + excluded.count,
                   last_event = GREATEST(org_event_stats.last_event, excluded.last_event)",
};

const REFRESH_USER_DISPLAY: Sql = Sql {
    sqlite: "UPDATE user_event_stats SET display_name = ?2 WHERE user_id = ?1",
    postgres: "UPDATE user_event_stats SET display_name = $2 WHERE user_id = $1",
};

const USER_AUTHORITATIVE: Sql = Sql {
    sqlite: "SELECT COUNT(*) AS n, MAX(timestamp) AS last_event, MAX(user_name) AS display_name
             FROM telemetry_events
             WHERE user_id = ?1 AND deleted_at IS NULL",
    postgres: "SELECT COUNT(*) AS n, MAX(timestamp) AS last_event, MAX(user_name) AS display_name
               FROM telemetry_events
               WHERE user_id = $1 AND deleted_at IS NULL",
};

const ORG_AUTHORITATIVE: Sql = Sql {
    sqlite: "SELECT COUNT(*) AS n, MAX(timestamp) AS last_event
             FROM telemetry_events
             WHERE org_id = ?1 AND deleted_at IS NULL",
    postgres: "SELECT COUNT(*) AS n, MAX(timestamp) AS last_event
               FROM telemetry_events
               WHERE org_id = $1 AND deleted_at IS NULL",
};

const UPSERT_USER_STAT: Sql = Sql {
    sqlite: "INSERT INTO user_event_stats (user_id, count, last_event, display_name)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 count = excluded.count,
                 last_event = excluded.last_event,
                 display_name = COALESCE(user_event_stats.display_name, excluded.display_name)",
    postgres: "INSERT INTO user_event_stats (user_id, count, last_event, display_name)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (user_id) DO UPDATE SET
                   count = excluded.count,
                   last_event = excluded.last_event,
                   display_name = COALESCE(user_event_stats.display_name, excluded.display_name)",
};

const UPSERT_ORG_STAT: Sql = Sql {
    sqlite: "INSERT INTO org_event_stats (org_id, count, last_event)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(org_id) DO UPDATE SET
                 count = excluded.count,
                 last_event = excluded.last_event",
    postgres: "INSERT INTO org_event_stats (org_id, count, last_event)
               VALUES ($1, $2, $3)
               ON CONFLICT (org_id) DO UPDATE SET
                   count = excluded.count,
                   last_event = excluded.last_event",
};

const DELETE_USER_STAT: Sql = Sql {
    sqlite: "DELETE FROM user_event_stats WHERE user_id = ?1",
    postgres: "DELETE FROM user_event_stats WHERE user_id = $1",
};

const DELETE_ORG_STAT: Sql = Sql {
    sqlite: "DELETE FROM org_event_stats WHERE org_id = ?1",
    postgres: "DELETE FROM org_event_stats WHERE org_id = $1",
};

const GET_USER_STAT: Sql = Sql {
    sqlite: "SELECT user_id, count, last_event, display_name FROM user_event_stats WHERE user_id = ?1",
    postgres: "SELECT user_id, count, last_event, display_name FROM user_event_stats WHERE user_id = $1",
};

const GET_ORG_STAT: Sql = Sql {
    sqlite: "SELECT org_id, count, last_event FROM org_event_stats WHERE org_id = ?1",
    postgres: "SELECT org_id, count, last_event FROM org_event_stats WHERE org_id = $1",
};

const BACKFILL_USER_STATS: Sql = Sql {
    sqlite: "INSERT INTO user_event_stats (user_id, count, last_event, display_name)
             SELECT user_id, COUNT(*), MAX(timestamp), MAX(user_name)
             FROM telemetry_events
             WHERE user_id IS NOT NULL AND deleted_at IS NULL
             GROUP BY user_id",
    postgres: "INSERT INTO user_event_stats (user_id, count, last_event, display_name)
               SELECT user_id, COUNT(*), MAX(timestamp), MAX(user_name)
               FROM telemetry_events
               WHERE user_id IS NOT NULL AND deleted_at IS NULL
               GROUP BY user_id",
};

const BACKFILL_ORG_STATS: Sql = Sql {
    sqlite: "INSERT INTO org_event_stats (org_id, count, last_event)
             SELECT org_id, COUNT(*), MAX(timestamp)
             FROM telemetry_events
             WHERE org_id IS NOT NULL AND deleted_at IS NULL
             GROUP BY org_id",
    postgres: "INSERT INTO org_event_stats (org_id, count, last_event)
               SELECT org_id, COUNT(*), MAX(timestamp)
               FROM telemetry_events
               WHERE org_id IS NOT NULL AND deleted_at IS NULL
               GROUP BY org_id",
};

impl Database {
    /// Add `n` events to a user's counter. `display_name` is kept on first
    /// sight and never overwritten here; use
    /// [`refresh_user_display_name`](Self::refresh_user_display_name) to
    /// replace it explicitly.
    pub fn incr_user_events(
        &self,
        user_id: &str,
        n: i64,
        last_event: DateTime<Utc>,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.execute(
            &INCR_USER,
            &sql_params![user_id, n, last_event, display_name.map(str::to_string)],
        )?;
        Ok(())
    }

    /// Add `n` events to an org's counter.
    pub fn incr_org_events(&self, org_id: &str, n: i64, last_event: DateTime<Utc>) -> Result<()> {
        self.execute(&INCR_ORG, &sql_params![org_id, n, last_event])?;
        Ok(())
    }

    /// Explicitly replace a user's display name on the rollup row.
    pub fn refresh_user_display_name(&self, user_id: &str, display_name: &str) -> Result<()> {
        self.execute(&REFRESH_USER_DISPLAY, &sql_params![user_id, display_name])?;
        Ok(())
    }

    pub fn get_user_event_stat(&self, user_id: &str) -> Result<Option<EventStat>> {
        let row = self.query_one(&GET_USER_STAT, &sql_params![user_id])?;
        row.map(|r| {
            Ok(EventStat {
                key: r.get_str("user_id")?,
                count: r.get_i64("count")?,
                last_event: r.get_opt_datetime("last_event")?,
                display_name: r.get_opt_str("display_name")?,
            })
        })
        .transpose()
    }

    pub fn get_org_event_stat(&self, org_id: &str) -> Result<Option<EventStat>> {
        let row = self.query_one(&GET_ORG_STAT, &sql_params![org_id])?;
        row.map(|r| {
            Ok(EventStat {
                key: r.get_str("org_id")?,
                count: r.get_i64("count")?,
                last_event: r.get_opt_datetime("last_event")?,
                display_name: None,
            })
        })
        .transpose()
    }

    /// Recompute user counters from the fact table for the given keys.
    /// Rows whose authoritative count is zero are deleted.
    pub fn recompute_user_event_stats(&self, user_ids: &[String]) -> Result<()> {
        for user_id in user_ids {
            let Some(row) = self.query_one(&USER_AUTHORITATIVE, &sql_params![user_id])? else {
                continue;
            };
            let count = row.get_i64("n")?;
            if count == 0 {
                self.execute(&DELETE_USER_STAT, &sql_params![user_id])?;
            } else {
                self.execute(
                    &UPSERT_USER_STAT,
                    &sql_params![
                        user_id,
                        count,
                        row.get_opt_datetime("last_event")?,
                        row.get_opt_str("display_name")?
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Recompute org counters from the fact table for the given keys.
    pub fn recompute_org_event_stats(&self, org_ids: &[String]) -> Result<()> {
        for org_id in org_ids {
            let Some(row) = self.query_one(&ORG_AUTHORITATIVE, &sql_params![org_id])? else {
                continue;
            };
            let count = row.get_i64("n")?;
            if count == 0 {
                self.execute(&DELETE_ORG_STAT, &sql_params![org_id])?;
            } else {
                self.execute(
                    &UPSERT_ORG_STAT,
                    &sql_params![org_id, count, row.get_opt_datetime("last_event")?],
                )?;
            }
        }
        Ok(())
    }

    /// One-time seeding: rebuild either rollup table from the fact table if
    /// it is empty at startup.
    pub fn backfill_stats_if_empty(&self) -> Result<()> {
        let users_empty = self
            .query_one(&Sql::same("SELECT COUNT(*) AS n FROM user_event_stats"), &[])?
            .map(|r| r.get_i64("n").unwrap_or(0) == 0)
            .unwrap_or(true);
        if users_empty {
            tracing::info!("Backfilling user_event_stats from the fact table");
            self.execute(&BACKFILL_USER_STATS, &[])?;
        }

        let orgs_empty = self
            .query_one(&Sql::same("SELECT COUNT(*) AS n FROM org_event_stats"), &[])?
            .map(|r| r.get_i64("n").unwrap_or(0) == 0)
            .unwrap_or(true);
        if orgs_empty {
            tracing::info!("Backfilling org_event_stats from the fact table");
            self.execute(&BACKFILL_ORG_STATS, &[])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_test_db;

    #[test]
    fn test_incr_creates_then_adds() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());

        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::minutes(5);

        db.incr_user_events("u1", 1, t2, Some("First Name")).unwrap();
        // an older event must not move last_event backwards, and the first
        // display name sticks
        db.incr_user_events("u1", 2, t1, Some("Second Name")).unwrap();

        let stat = db.get_user_event_stat("u1").unwrap().unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.last_event.unwrap().timestamp(), t2.timestamp());
        assert_eq!(stat.display_name.as_deref(), Some("First Name"));
    }

    #[test]
    fn test_refresh_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());

        db.incr_user_events("u1", 1, Utc::now(), Some("Old")).unwrap();
        db.refresh_user_display_name("u1", "New").unwrap();
        let stat = db.get_user_event_stat("u1").unwrap().unwrap();
        assert_eq!(stat.display_name.as_deref(), Some("New"));
    }

    #[test]
    fn test_recompute_deletes_empty_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());

        // counter exists but there are no events at all
        db.incr_user_events("ghost", 5, Utc::now(), None).unwrap();
        db.recompute_user_event_stats(&["ghost".to_string()]).unwrap();
        assert!(db.get_user_event_stat("ghost").unwrap().is_none());

        db.incr_org_events("ghost-org", 2, Utc::now()).unwrap();
        db.recompute_org_event_stats(&["ghost-org".to_string()]).unwrap();
        assert!(db.get_org_event_stat("ghost-org").unwrap().is_none());
    }

    #[test]
    fn test_backfill_only_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());

        db.incr_user_events("u1", 7, Utc::now(), None).unwrap();
        // table not empty: backfill must not touch the existing row
        db.backfill_stats_if_empty().unwrap();
        assert_eq!(db.get_user_event_stat("u1").unwrap().unwrap().count, 7);
    }
}
