//! Background backfills
//!
//! Two workers run after startup on their own threads, each in bounded
//! batches of at most 1000 rows with one short transaction per batch, so
//! a crash mid-backfill loses nothing and the next start resumes where
//! the data says it should. Neither worker ever blocks reads or writes;
//! failures are logged and retried on the next start.
//!
//! - denormalization: populate the payload-derived columns on rows
//!   written before those columns existed
//! - v2 derivation: stamp `area`, `success` and
//!   `telemetry_schema_version = 1` onto legacy rows

use crate::db::{Database, Sql, StorageTransaction};
use crate::error::Result;
use crate::ingest::parser;
use crate::sql_params;
use std::thread::JoinHandle;

/// Rows processed per transaction.
pub const BATCH_SIZE: usize = 1000;

/// Spawn both backfill workers. Their outcome is logged; a failure is
/// transient and the work is retried on next start.
pub fn spawn_all(db: Database) -> Vec<JoinHandle<()>> {
    let denorm_db = db.clone();
    let denorm = std::thread::Builder::new()
        .name("backfill-denorm".to_string())
        .spawn(move || match run_denormalization(&denorm_db) {
            Ok(0) => {}
            Ok(rows) => tracing::info!(rows, "Denormalization backfill complete"),
            Err(e) => tracing::warn!(error = %e, "Denormalization backfill failed; will retry next start"),
        });

    let derive_db = db;
    let derive = std::thread::Builder::new()
        .name("backfill-v2".to_string())
        .spawn(move || match run_v2_derivation(&derive_db) {
            Ok(0) => {}
            Ok(rows) => tracing::info!(rows, "Schema v2 derivation backfill complete"),
            Err(e) => tracing::warn!(error = %e, "Schema v2 derivation failed; will retry next start"),
        });

    [denorm, derive]
        .into_iter()
        .filter_map(|h| match h {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to spawn backfill worker");
                None
            }
        })
        .collect()
}

const ANY_DENORM_NULL: Sql = Sql::same(
    "SELECT COUNT(*) AS n FROM telemetry_events
     WHERE org_id IS NULL AND user_name IS NULL AND tool_name IS NULL
       AND company_name IS NULL AND error_message IS NULL",
);

const DENORM_BATCH: Sql = Sql {
    sqlite: "SELECT id, data FROM telemetry_events
             WHERE id > ?1
               AND org_id IS NULL AND user_name IS NULL AND tool_name IS NULL
               AND company_name IS NULL AND error_message IS NULL
             ORDER BY id LIMIT ?2",
    postgres: "SELECT id, data FROM telemetry_events
               WHERE id > $1
                 AND org_id IS NULL AND user_name IS NULL AND tool_name IS NULL
                 AND company_name IS NULL AND error_message IS NULL
               ORDER BY id LIMIT $2",
};

const DENORM_UPDATE: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET
                 org_id = COALESCE(org_id, ?2),
                 user_name = COALESCE(user_name, ?3),
                 tool_name = COALESCE(tool_name, ?4),
                 company_name = COALESCE(company_name, ?5),
                 error_message = COALESCE(error_message, ?6)
             WHERE id = ?1",
    postgres: "UPDATE telemetry_events SET
                   org_id = COALESCE(org_id, $2),
                   user_name = COALESCE(user_name, $3),
                   tool_name = COALESCE(tool_name, $4),
                   company_name = COALESCE(company_name, $5),
                   error_message = COALESCE(error_message, $6)
               WHERE id = $1",
};

/// Populate denormalized columns from stored payloads. Returns the number
/// of rows updated.
///
/// The cursor walks ids upward so rows whose payload simply has none of
/// the fields cannot make the loop spin forever.
pub fn run_denormalization(db: &Database) -> Result<u64> {
    let pending = db
        .query_one(&ANY_DENORM_NULL, &[])?
        .map(|r| r.get_i64("n").unwrap_or(0))
        .unwrap_or(0);
    if pending == 0 {
        return Ok(0);
    }

    tracing::info!(pending, "Starting denormalization backfill");

    let mut updated = 0u64;
    let mut cursor = 0i64;

    loop {
        let rows = db.query(&DENORM_BATCH, &sql_params![cursor, BATCH_SIZE])?;
        if rows.is_empty() {
            break;
        }

        let mut tx = db.transaction()?;
        for row in &rows {
            let id = row.get_i64("id")?;
            cursor = cursor.max(id);

            let data = row.get_json("data")?;
            let denorm = parser::extract_denormalized(&serde_json::json!({ "data": data }));
            if denorm.org_id.is_none()
                && denorm.user_name.is_none()
                && denorm.tool_name.is_none()
                && denorm.company_name.is_none()
                && denorm.error_message.is_none()
            {
                continue;
            }

            updated += apply_denorm_update(&mut *tx, db, id, &denorm)?;
        }
        tx.commit()?;

        if rows.len() < BATCH_SIZE {
            break;
        }
    }

    Ok(updated)
}

fn apply_denorm_update(
    tx: &mut dyn StorageTransaction,
    db: &Database,
    id: i64,
    denorm: &crate::types::Denormalized,
) -> Result<u64> {
    tx.execute(
        DENORM_UPDATE.for_kind(db.kind()),
        &sql_params![
            id,
            denorm.org_id.clone(),
            denorm.user_name.clone(),
            denorm.tool_name.clone(),
            denorm.company_name.clone(),
            denorm.error_message.clone()
        ],
    )
}

const V2_DERIVE_BATCH: Sql = Sql {
    sqlite: "UPDATE telemetry_events SET
                 area = COALESCE(area, CASE
                     WHEN event_id IN (SELECT id FROM event_types WHERE name IN ('tool_call', 'tool_error')) THEN 'tool'
                     WHEN event_id IN (SELECT id FROM event_types WHERE name IN ('session_start', 'session_end')) THEN 'session'
                     ELSE 'general'
                 END),
                 success = CASE
                     WHEN event_id IN (SELECT id FROM event_types WHERE name IN ('tool_error', 'error')) THEN 0
                     ELSE success
                 END,
                 telemetry_schema_version = 1
             WHERE id IN (
                 SELECT id FROM telemetry_events
                 WHERE telemetry_schema_version IS NULL
                 ORDER BY id LIMIT ?1
             )",
    postgres: "UPDATE telemetry_events SET
                   area = COALESCE(area, CASE
                       WHEN event_id IN (SELECT id FROM event_types WHERE name IN ('tool_call', 'tool_error')) THEN 'tool'
                       WHEN event_id IN (SELECT id FROM event_types WHERE name IN ('session_start', 'session_end')) THEN 'session'
                       ELSE 'general'
                   END),
                   success = CASE
                       WHEN event_id IN (SELECT id FROM event_types WHERE name IN ('tool_error', 'error')) THEN FALSE
                       ELSE success
                   END,
                   telemetry_schema_version = 1
               WHERE id IN (
                   SELECT id FROM telemetry_events
                   WHERE telemetry_schema_version IS NULL
                   ORDER BY id LIMIT $1
               )",
};

/// Stamp v2-era fields onto legacy rows: `area` from the event type,
/// `success` from the error-ness of the type, and schema version 1.
/// Returns the number of rows updated.
pub fn run_v2_derivation(db: &Database) -> Result<u64> {
    let mut updated = 0u64;
    loop {
        let affected = db.execute(&V2_DERIVE_BATCH, &sql_params![BATCH_SIZE])?;
        updated += affected;
        if affected == 0 {
            break;
        }
    }
    if updated > 0 {
        tracing::info!(updated, "Derived v2 fields for legacy rows");
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_test_db;

    /// Insert a bare legacy row with no denormalized columns set.
    fn insert_legacy(db: &Database, data: &str) -> i64 {
        db.backend()
            .unwrap()
            .insert(
                "INSERT INTO telemetry_events
                     (event_id, timestamp, received_at, created_at, data, user_id, success)
                 VALUES
                     ((SELECT id FROM event_types WHERE name = 'tool_error'),
                      '2025-01-01T00:00:00.000Z', '2025-01-01T00:00:00.000Z',
                      '2025-01-01T00:00:00.000Z', ?1, 'u1', 1)
                 RETURNING id",
                &sql_params![data],
            )
            .unwrap()
    }

    #[test]
    fn test_denormalization_backfill() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());

        let id = insert_legacy(
            &db,
            r#"{"toolName": "describe_object", "errorMessage": "boom", "orgId": "org-1"}"#,
        );
        // payload with nothing extractable must not wedge the loop
        insert_legacy(&db, r#"{"unrelated": true}"#);

        let updated = run_denormalization(&db).unwrap();
        assert_eq!(updated, 1);

        let row = db
            .backend()
            .unwrap()
            .query_one(
                "SELECT org_id, tool_name, error_message FROM telemetry_events WHERE id = ?1",
                &sql_params![id],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get_str("org_id").unwrap(), "org-1");
        assert_eq!(row.get_str("tool_name").unwrap(), "describe_object");
        assert_eq!(row.get_str("error_message").unwrap(), "boom");

        // second run finds nothing new to write
        assert_eq!(run_denormalization(&db).unwrap(), 0);
    }

    #[test]
    fn test_v2_derivation_backfill() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());

        let id = insert_legacy(&db, "{}");

        let updated = run_v2_derivation(&db).unwrap();
        assert_eq!(updated, 1);

        let row = db
            .backend()
            .unwrap()
            .query_one(
                "SELECT area, success, telemetry_schema_version FROM telemetry_events WHERE id = ?1",
                &sql_params![id],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get_str("area").unwrap(), "tool");
        assert!(!row.get_bool("success").unwrap(), "tool_error rows derive success = false");
        assert_eq!(row.get_i64("telemetry_schema_version").unwrap(), 1);

        assert_eq!(run_v2_derivation(&db).unwrap(), 0);
    }
}
