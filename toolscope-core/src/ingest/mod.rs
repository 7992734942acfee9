//! Ingestion pipeline for telemetry payloads
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────────────┐     ┌────────────────┐
//! │ JSON payload│ ──► │ Ingestor                     │ ──► │ telemetry_     │
//! │ (v1 or v2)  │     │  parse → validate → resolve  │     │ events + stats │
//! └─────────────┘     │  parent session → insert     │     └────────────────┘
//!                     └──────────────────────────────┘
//! ```
//!
//! Malformed or invalid events are never dropped on the floor: they are
//! quarantined as `error`/`general` rows carrying the rejection reason and
//! the raw payload, and the batch continues. Aggregate counters and org
//! company names are updated best-effort after the insert transaction
//! commits; their failures never surface to the caller.

pub mod parser;
pub mod sessions;

use crate::config::Config;
use crate::db::{Database, Sql, SqlValue, StorageTransaction};
use crate::error::{Result, ValidationError};
use crate::sql_params;
use crate::types::{Area, EventType, ParsedEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Largest accepted batch. Larger batches are rejected outright; splitting
/// is the caller's job.
pub const MAX_BATCH: usize = 1000;

/// Outcome of ingesting one payload.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Event stored with its resolved logical parent session
    Stored {
        id: i64,
        parent_session_id: Option<String>,
    },
    /// Event failed validation and was stored in quarantine instead
    Quarantined { id: i64, reason: String },
    /// Ingest is disabled by configuration
    Skipped,
}

/// Per-batch summary: per-event outcomes, never an all-or-nothing failure.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub successful: usize,
    pub errors: usize,
    pub failures: Vec<BatchFailure>,
}

/// One quarantined payload within a batch.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub index: usize,
    pub reason: String,
}

/// Validates, normalizes and persists telemetry payloads.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    disabled: bool,
}

const INSERT_EVENT: Sql = Sql {
    sqlite: "INSERT INTO telemetry_events (
                 event_id, area, timestamp, server_id, version, session_id,
                 parent_session_id, user_id, data, received_at, created_at,
                 org_id, user_name, tool_name, company_name, error_message,
                 team_id, success, telemetry_schema_version
             ) VALUES (
                 (SELECT id FROM event_types WHERE name = ?1),
                 ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
             ) RETURNING id",
    postgres: "INSERT INTO telemetry_events (
                   event_id, area, timestamp, server_id, version, session_id,
                   parent_session_id, user_id, data, received_at, created_at,
                   org_id, user_name, tool_name, company_name, error_message,
                   team_id, success, telemetry_schema_version
               ) VALUES (
                   (SELECT id FROM event_types WHERE name = $1),
                   $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                   $12, $13, $14, $15, $16, $17, $18, $19
               ) RETURNING id",
};

const ORG_TEAM_FOR_SERVER: Sql = Sql {
    sqlite: "SELECT team_id FROM orgs WHERE server_id = ?1",
    postgres: "SELECT team_id FROM orgs WHERE server_id = $1",
};

/// Side effects accumulated during a batch and applied after commit.
#[derive(Debug, Default)]
struct SideEffects {
    /// server_id → company name
    company_names: HashMap<String, String>,
    /// user_id → (increments, max timestamp, first display name seen)
    user_incr: HashMap<String, (i64, DateTime<Utc>, Option<String>)>,
    /// org_id → (increments, max timestamp)
    org_incr: HashMap<String, (i64, DateTime<Utc>)>,
}

impl SideEffects {
    fn record(&mut self, event: &ParsedEvent) {
        if let (Some(server_id), Some(company)) = (
            event.server_id.as_ref(),
            event.denormalized.company_name.as_ref(),
        ) {
            self.company_names
                .insert(server_id.clone(), company.clone());
        }

        if let Some(user_id) = &event.user_id {
            let entry = self
                .user_incr
                .entry(user_id.clone())
                .or_insert((0, event.timestamp, None));
            entry.0 += 1;
            entry.1 = entry.1.max(event.timestamp);
            if entry.2.is_none() {
                entry.2 = event.denormalized.user_name.clone();
            }
        }

        if let Some(org_id) = &event.denormalized.org_id {
            let entry = self
                .org_incr
                .entry(org_id.clone())
                .or_insert((0, event.timestamp));
            entry.0 += 1;
            entry.1 = entry.1.max(event.timestamp);
        }
    }
}

impl Ingestor {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            disabled: config.telemetry_disabled,
        }
    }

    /// Ingest a single payload in its own transaction.
    pub fn ingest(&self, payload: &Value) -> Result<IngestOutcome> {
        if self.disabled {
            return Ok(IngestOutcome::Skipped);
        }

        let received_at = Utc::now();
        let mut effects = SideEffects::default();

        let mut tx = self.db.transaction()?;
        let outcome = self.ingest_one(&mut *tx, payload, received_at, &mut effects)?;
        tx.commit()?;

        self.apply_side_effects(effects);
        Ok(outcome)
    }

    /// Ingest a batch of up to [`MAX_BATCH`] payloads in one transaction.
    ///
    /// Individual bad events are quarantined and counted as errors; only
    /// storage failures abort the batch.
    pub fn ingest_batch(&self, payloads: &[Value]) -> Result<BatchSummary> {
        if self.disabled {
            return Ok(BatchSummary::default());
        }
        if payloads.len() > MAX_BATCH {
            return Err(ValidationError::MalformedPayload(format!(
                "batch of {} exceeds the {} event limit",
                payloads.len(),
                MAX_BATCH
            ))
            .into());
        }

        let received_at = Utc::now();
        let mut effects = SideEffects::default();
        let mut summary = BatchSummary::default();

        let mut tx = self.db.transaction()?;
        for (index, payload) in payloads.iter().enumerate() {
            match self.ingest_one(&mut *tx, payload, received_at, &mut effects)? {
                IngestOutcome::Stored { .. } => summary.successful += 1,
                IngestOutcome::Quarantined { reason, .. } => {
                    summary.errors += 1;
                    summary.failures.push(BatchFailure { index, reason });
                }
                IngestOutcome::Skipped => {}
            }
        }
        tx.commit()?;

        self.apply_side_effects(effects);

        tracing::debug!(
            successful = summary.successful,
            errors = summary.errors,
            "Batch ingested"
        );
        Ok(summary)
    }

    fn ingest_one(
        &self,
        tx: &mut dyn StorageTransaction,
        payload: &Value,
        received_at: DateTime<Utc>,
        effects: &mut SideEffects,
    ) -> Result<IngestOutcome> {
        let parsed = match parser::parse(payload, received_at) {
            Ok(parsed) => parsed,
            Err(e) => {
                let id = self.quarantine(tx, payload, received_at, &e.to_string())?;
                return Ok(IngestOutcome::Quarantined {
                    id,
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = validate(&parsed, payload) {
            let id = self.quarantine(tx, payload, received_at, &e.to_string())?;
            return Ok(IngestOutcome::Quarantined {
                id,
                reason: e.to_string(),
            });
        }

        let parent_session_id = sessions::resolve(tx, self.db.kind(), &parsed)?;

        // Snapshot the org's team at write time; later reassignment does not
        // propagate until an explicit recalculation
        let team_key = parsed
            .denormalized
            .org_id
            .as_deref()
            .or(parsed.server_id.as_deref());
        let team_id = match team_key {
            Some(key) => tx
                .query_one(ORG_TEAM_FOR_SERVER.for_kind(self.db.kind()), &sql_params![key])?
                .and_then(|row| row.get_opt_i64("team_id").ok().flatten()),
            None => None,
        };

        let id = tx.insert(
            INSERT_EVENT.for_kind(self.db.kind()),
            &sql_params![
                parsed.event_type.as_str(),
                parsed.area.as_str(),
                parsed.timestamp,
                parsed.server_id.clone(),
                parsed.version.clone(),
                parsed.session_id.clone(),
                parent_session_id.clone(),
                parsed.user_id.clone(),
                parsed.data.clone(),
                received_at,
                Utc::now(),
                parsed.denormalized.org_id.clone(),
                parsed.denormalized.user_name.clone(),
                parsed.denormalized.tool_name.clone(),
                parsed.denormalized.company_name.clone(),
                parsed.denormalized.error_message.clone(),
                team_id,
                parsed.success,
                parsed.schema_version
            ],
        )?;

        effects.record(&parsed);

        Ok(IngestOutcome::Stored {
            id,
            parent_session_id,
        })
    }

    /// Store a rejected payload as an `error`/`general` row with the
    /// rejection reason, so nothing is silently lost.
    fn quarantine(
        &self,
        tx: &mut dyn StorageTransaction,
        payload: &Value,
        received_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<i64> {
        tx.insert(
            INSERT_EVENT.for_kind(self.db.kind()),
            &sql_params![
                EventType::Error.as_str(),
                Area::General.as_str(),
                received_at,
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
                payload.clone(),
                received_at,
                Utc::now(),
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
                reason,
                SqlValue::Null,
                false,
                SqlValue::Null
            ],
        )
    }

    /// Apply coalesced post-commit side effects. Best-effort: failures are
    /// logged, never propagated to the ingest caller.
    fn apply_side_effects(&self, effects: SideEffects) {
        for (server_id, company_name) in effects.company_names {
            if let Err(e) = self.db.upsert_org_company(&server_id, &company_name) {
                tracing::warn!(server_id, error = %e, "Org company upsert failed");
            }
        }

        for (user_id, (n, last_event, display_name)) in effects.user_incr {
            if let Err(e) =
                self.db
                    .incr_user_events(&user_id, n, last_event, display_name.as_deref())
            {
                tracing::warn!(user_id, error = %e, "User counter update failed");
            }
        }

        for (org_id, (n, last_event)) in effects.org_incr {
            if let Err(e) = self.db.incr_org_events(&org_id, n, last_event) {
                tracing::warn!(org_id, error = %e, "Org counter update failed");
            }
        }
    }
}

/// The missing-user rule: events without a user id are quarantined unless
/// they are session starts, come from the exempt boot/connect probes, or
/// carry the explicit override.
fn validate(parsed: &ParsedEvent, payload: &Value) -> std::result::Result<(), ValidationError> {
    if parsed.user_id.is_some() {
        return Ok(());
    }
    if parsed.event_type == EventType::SessionStart {
        return Ok(());
    }
    if let Some(name) = parsed.raw_event_name.as_deref() {
        if parser::MISSING_USER_EXEMPT.contains(&name) {
            return Ok(());
        }
    }
    let override_flag = payload
        .get("allowMissingUser")
        .or_else(|| payload.get("data").and_then(|d| d.get("allowMissingUser")))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if override_flag {
        return Ok(());
    }
    Err(ValidationError::MissingRequiredField("userId"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_test_db;
    use serde_json::json;

    fn ingestor(db: &Database) -> Ingestor {
        Ingestor::new(db.clone(), &Config::default())
    }

    fn stored_id(outcome: IngestOutcome) -> i64 {
        match outcome {
            IngestOutcome::Stored { id, .. } => id,
            other => panic!("expected stored event, got {:?}", other),
        }
    }

    #[test]
    fn test_ingest_single_event() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        let outcome = ingestor
            .ingest(&json!({
                "event": "tool_call",
                "timestamp": "2025-01-01T09:00:00Z",
                "serverId": "org-1",
                "version": "1.0.0",
                "sessionId": "s1",
                "userId": "u1",
                "data": {"toolName": "query_runner"}
            }))
            .unwrap();

        let id = stored_id(outcome);
        let row = db
            .backend()
            .unwrap()
            .query_one(
                "SELECT tool_name, user_id, parent_session_id FROM telemetry_events WHERE id = ?1",
                &sql_params![id],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get_str("tool_name").unwrap(), "query_runner");
        assert_eq!(row.get_str("user_id").unwrap(), "u1");
        // no prior session_start: the physical session is its own parent
        assert_eq!(row.get_str("parent_session_id").unwrap(), "s1");
    }

    #[test]
    fn test_missing_user_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        let outcome = ingestor
            .ingest(&json!({
                "event": "tool_call",
                "timestamp": "2025-01-01T09:00:00Z",
                "serverId": "org-1",
                "data": {}
            }))
            .unwrap();

        let IngestOutcome::Quarantined { id, reason } = outcome else {
            panic!("expected quarantine");
        };
        assert!(reason.contains("userId"));

        let row = db
            .backend()
            .unwrap()
            .query_one(
                "SELECT et.name AS name, e.area, e.success, e.error_message
                 FROM telemetry_events e JOIN event_types et ON et.id = e.event_id
                 WHERE e.id = ?1",
                &sql_params![id],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get_str("name").unwrap(), "error");
        assert_eq!(row.get_str("area").unwrap(), "general");
        assert!(!row.get_bool("success").unwrap());
        assert!(row.get_str("error_message").unwrap().contains("userId"));
    }

    #[test]
    fn test_missing_user_exemptions() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        // session_start without a user is allowed
        let outcome = ingestor
            .ingest(&json!({
                "event": "session_start",
                "timestamp": "2025-01-01T09:00:00Z",
                "serverId": "org-1",
                "sessionId": "s1",
                "data": {}
            }))
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));

        // exempt probe events are allowed
        let outcome = ingestor
            .ingest(&json!({
                "event": "server_boot",
                "timestamp": "2025-01-01T09:00:01Z",
                "serverId": "org-1",
                "data": {}
            }))
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));

        // the override flag is allowed
        let outcome = ingestor
            .ingest(&json!({
                "event": "tool_call",
                "timestamp": "2025-01-01T09:00:02Z",
                "serverId": "org-1",
                "data": {"allowMissingUser": true}
            }))
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
    }

    #[test]
    fn test_batch_mixes_good_and_bad() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        let batch = vec![
            json!({
                "event": "tool_call",
                "timestamp": "2025-01-01T09:00:00Z",
                "serverId": "org-1",
                "userId": "u1",
                "data": {}
            }),
            json!({"bogus": true}),
            json!({
                "event": "tool_error",
                "timestamp": "2025-01-01T09:01:00Z",
                "serverId": "org-1",
                "userId": "u1",
                "data": {"errorMessage": "boom"}
            }),
        ];

        let summary = ingestor.ingest_batch(&batch).unwrap();
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.failures[0].index, 1);
    }

    #[test]
    fn test_batch_over_limit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        let batch: Vec<Value> = (0..(MAX_BATCH + 1)).map(|_| json!({})).collect();
        assert!(ingestor.ingest_batch(&batch).is_err());
    }

    #[test]
    fn test_disabled_ingest_skips() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let mut config = Config::default();
        config.telemetry_disabled = true;
        let ingestor = Ingestor::new(db.clone(), &config);

        let outcome = ingestor.ingest(&json!({"event": "tool_call"})).unwrap();
        assert!(matches!(outcome, IngestOutcome::Skipped));

        let rows = db
            .backend()
            .unwrap()
            .query("SELECT COUNT(*) AS n FROM telemetry_events", &[])
            .unwrap();
        assert_eq!(rows[0].get_i64("n").unwrap(), 0);
    }

    #[test]
    fn test_counters_incremented() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        for i in 0..3 {
            ingestor
                .ingest(&json!({
                    "event": "tool_call",
                    "timestamp": format!("2025-01-01T09:0{}:00Z", i),
                    "serverId": "org-1",
                    "userId": "u1",
                    "data": {"orgId": "org-1", "userName": "User One"}
                }))
                .unwrap();
        }

        let user = db.get_user_event_stat("u1").unwrap().unwrap();
        assert_eq!(user.count, 3);
        assert_eq!(user.display_name.as_deref(), Some("User One"));

        let org = db.get_org_event_stat("org-1").unwrap().unwrap();
        assert_eq!(org.count, 3);
    }

    #[test]
    fn test_company_name_upserted() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = ingestor(&db);

        ingestor
            .ingest(&json!({
                "event": "session_start",
                "timestamp": "2025-01-01T09:00:00Z",
                "serverId": "org-1",
                "sessionId": "s1",
                "userId": "u1",
                "data": {"state": {"org": {"id": "org-1", "companyDetails": {"Name": "Acme"}}}}
            }))
            .unwrap();

        let org = db.get_org("org-1").unwrap().unwrap();
        assert_eq!(org.company_name.as_deref(), Some("Acme"));
    }
}
