//! Full-database export and import
//!
//! The export is a single JSON document:
//! `{version, exportedAt, dbType, tables: {...}}` with one array per
//! table. Binary columns are hex-encoded, timestamps RFC 3339. Import is
//! conflict-update by primary key inside one transaction, so re-importing
//! a document is idempotent.

use super::{BackendKind, Database, SqlValue};
use crate::error::{Error, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};

/// Format version stamped into every export document.
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColKind {
    Int,
    Text,
    Bool,
    Timestamp,
    Json,
    Bytes,
}

struct Col {
    name: &'static str,
    kind: ColKind,
}

const fn col(name: &'static str, kind: ColKind) -> Col {
    Col { name, kind }
}

struct TableSpec {
    name: &'static str,
    pk: &'static [&'static str],
    columns: &'static [Col],
}

/// Tables included in an export, in import-safe order (referenced tables
/// first).
const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "teams",
        pk: &["id"],
        columns: &[
            col("id", ColKind::Int),
            col("name", ColKind::Text),
            col("color", ColKind::Text),
            col("logo_data", ColKind::Bytes),
            col("logo_mime", ColKind::Text),
        ],
    },
    TableSpec {
        name: "orgs",
        pk: &["server_id"],
        columns: &[
            col("server_id", ColKind::Text),
            col("company_name", ColKind::Text),
            col("alias", ColKind::Text),
            col("color", ColKind::Text),
            col("team_id", ColKind::Int),
        ],
    },
    TableSpec {
        name: "users",
        pk: &["id"],
        columns: &[
            col("id", ColKind::Int),
            col("username", ColKind::Text),
            col("password_hash", ColKind::Text),
            col("role", ColKind::Text),
            col("last_login", ColKind::Timestamp),
        ],
    },
    TableSpec {
        name: "telemetry_events",
        pk: &["id"],
        columns: &[
            col("id", ColKind::Int),
            col("event_id", ColKind::Int),
            col("area", ColKind::Text),
            col("timestamp", ColKind::Timestamp),
            col("server_id", ColKind::Text),
            col("version", ColKind::Text),
            col("session_id", ColKind::Text),
            col("parent_session_id", ColKind::Text),
            col("user_id", ColKind::Text),
            col("data", ColKind::Json),
            col("received_at", ColKind::Timestamp),
            col("created_at", ColKind::Timestamp),
            col("org_id", ColKind::Text),
            col("user_name", ColKind::Text),
            col("tool_name", ColKind::Text),
            col("company_name", ColKind::Text),
            col("error_message", ColKind::Text),
            col("team_id", ColKind::Int),
            col("deleted_at", ColKind::Timestamp),
            col("success", ColKind::Bool),
            col("telemetry_schema_version", ColKind::Int),
        ],
    },
    TableSpec {
        name: "settings",
        pk: &["key"],
        columns: &[col("key", ColKind::Text), col("value", ColKind::Text)],
    },
    TableSpec {
        name: "remember_tokens",
        pk: &["id"],
        columns: &[
            col("id", ColKind::Int),
            col("user_id", ColKind::Int),
            col("token_hash", ColKind::Text),
            col("expires_at", ColKind::Timestamp),
            col("revoked_at", ColKind::Timestamp),
            col("user_agent", ColKind::Text),
            col("ip", ColKind::Text),
            col("created_at", ColKind::Timestamp),
        ],
    },
    TableSpec {
        name: "event_user_teams",
        pk: &["user_id"],
        columns: &[col("user_id", ColKind::Text), col("team_id", ColKind::Int)],
    },
];

/// Tables whose integer primary key is backed by a sequence.
const SERIAL_TABLES: &[&str] = &["teams", "users", "telemetry_events", "remember_tokens"];

fn value_to_json(value: &SqlValue, kind: ColKind) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => {
            if kind == ColKind::Bool {
                json!(*i != 0)
            } else {
                json!(i)
            }
        }
        SqlValue::Real(f) => json!(f),
        SqlValue::Text(s) => match kind {
            ColKind::Json => serde_json::from_str(s).unwrap_or(Value::Null),
            _ => json!(s),
        },
        SqlValue::Bytes(b) => json!(hex::encode(b)),
        SqlValue::Json(v) => v.clone(),
        SqlValue::Timestamp(t) => json!(super::fmt_ts(t)),
        SqlValue::Bool(b) => json!(b),
    }
}

fn json_to_value(value: &Value, kind: ColKind) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let out = match kind {
        ColKind::Int => SqlValue::Integer(
            value
                .as_i64()
                .ok_or_else(|| Error::Config(format!("expected integer, got {}", value)))?,
        ),
        ColKind::Text => SqlValue::Text(
            value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        ),
        ColKind::Bool => SqlValue::Bool(value.as_bool().unwrap_or(value.as_i64() == Some(1))),
        ColKind::Timestamp => {
            let s = value
                .as_str()
                .ok_or_else(|| Error::Config(format!("expected timestamp, got {}", value)))?;
            SqlValue::Timestamp(
                super::parse_ts(s)
                    .ok_or_else(|| Error::Config(format!("invalid timestamp: {}", s)))?,
            )
        }
        ColKind::Json => SqlValue::Json(value.clone()),
        ColKind::Bytes => SqlValue::Bytes(
            hex::decode(value.as_str().unwrap_or_default())
                .map_err(|e| Error::Config(format!("invalid hex blob: {}", e)))?,
        ),
    };
    Ok(out)
}

fn upsert_sql(kind: BackendKind, spec: &TableSpec) -> String {
    let columns: Vec<&str> = spec.columns.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=columns.len())
        .map(|i| match kind {
            BackendKind::Sqlite => format!("?{}", i),
            BackendKind::Postgres => format!("${}", i),
        })
        .collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !spec.pk.contains(c))
        .map(|c| format!("{} = excluded.{}", c, c))
        .collect();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        spec.name,
        columns.join(", "),
        placeholders.join(", "),
        spec.pk.join(", "),
        conflict_action
    )
}

/// Summary of an import run.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub tables: usize,
    pub rows: u64,
}

impl Database {
    /// Export every counted table as one JSON document, streaming rows so
    /// large fact tables never fully materialize twice.
    pub fn export_database(&self) -> Result<Value> {
        let mut tables = Map::new();

        for spec in TABLES {
            let column_list: Vec<&str> = spec.columns.iter().map(|c| c.name).collect();
            let sql = format!("SELECT {} FROM {}", column_list.join(", "), spec.name);

            let mut rows: Vec<Value> = Vec::new();
            self.backend()?.query_streamed(&sql, &[], &mut |row| {
                let mut obj = Map::new();
                for colspec in spec.columns {
                    obj.insert(
                        colspec.name.to_string(),
                        value_to_json(row.value(colspec.name)?, colspec.kind),
                    );
                }
                rows.push(Value::Object(obj));
                Ok(())
            })?;

            tables.insert(spec.name.to_string(), Value::Array(rows));
        }

        Ok(json!({
            "version": EXPORT_FORMAT_VERSION,
            "exportedAt": super::fmt_ts(&Utc::now()),
            "dbType": self.kind().as_str(),
            "tables": Value::Object(tables),
        }))
    }

    /// Import a previously exported document. Conflict-update by primary
    /// key, one transaction for the whole document.
    pub fn import_database(&self, document: &Value) -> Result<ImportSummary> {
        let tables = document
            .get("tables")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Config("export document has no tables".to_string()))?;

        let mut summary = ImportSummary::default();
        let mut tx = self.transaction()?;

        for spec in TABLES {
            let Some(rows) = tables.get(spec.name).and_then(Value::as_array) else {
                continue;
            };
            summary.tables += 1;

            let sql = upsert_sql(self.kind(), spec);
            for row in rows {
                let obj = row.as_object().ok_or_else(|| {
                    Error::Config(format!("{}: row is not an object", spec.name))
                })?;
                let params: Vec<SqlValue> = spec
                    .columns
                    .iter()
                    .map(|colspec| {
                        json_to_value(obj.get(colspec.name).unwrap_or(&Value::Null), colspec.kind)
                    })
                    .collect::<Result<_>>()?;
                summary.rows += tx.execute(&sql, &params)?;
            }
        }

        // Imported explicit ids must not collide with future inserts
        if self.kind() == BackendKind::Postgres {
            for table in SERIAL_TABLES {
                tx.execute(
                    &format!(
                        "SELECT setval(pg_get_serial_sequence('{}', 'id'), \
                         GREATEST(COALESCE((SELECT MAX(id) FROM {}), 1), 1))",
                        table, table
                    ),
                    &[],
                )?;
            }
        }

        tx.commit()?;
        tracing::info!(tables = summary.tables, rows = summary.rows, "Import complete");
        Ok(summary)
    }
}
