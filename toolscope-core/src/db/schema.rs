//! Schema bootstrap and forward-only migrations
//!
//! `run` executes at startup and is re-entrant: every step is guarded by
//! catalog introspection, so running it twice yields the same schema. DDL
//! is only ever issued here; runtime paths assume a frozen schema.
//!
//! The order matters: the legacy `event` text column must be migrated into
//! `event_id` before the denormalized-column guards, and indexes are
//! (re)created only once all columns they cover exist.

use super::{BackendKind, Database, Sql};
use crate::config::Config;
use crate::error::Result;
use crate::sql_params;
use crate::types::CANONICAL_EVENT_TYPES;

/// Base tables for the embedded engine. Denormalized and later-added
/// columns are introduced by the guarded migrations below, so a database
/// created by any earlier release converges to the same shape.
const BASE_TABLES_SQLITE: &str = "
CREATE TABLE IF NOT EXISTS event_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS telemetry_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES event_types(id),
    timestamp TEXT NOT NULL,
    server_id TEXT,
    version TEXT,
    session_id TEXT,
    user_id TEXT,
    data TEXT,
    received_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orgs (
    server_id TEXT PRIMARY KEY,
    company_name TEXT
);

CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    color TEXT
);

CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    email TEXT
);

CREATE TABLE IF NOT EXISTS people_usernames (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id INTEGER NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    username TEXT NOT NULL,
    org_id TEXT,
    UNIQUE (person_id, username)
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'basic',
    last_login TEXT
);

CREATE TABLE IF NOT EXISTS remember_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TEXT NOT NULL,
    revoked_at TEXT,
    user_agent TEXT,
    ip TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS login_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    success INTEGER NOT NULL,
    ip TEXT,
    user_agent TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_event_stats (
    user_id TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    last_event TEXT,
    display_name TEXT
);

CREATE TABLE IF NOT EXISTS org_event_stats (
    org_id TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    last_event TEXT
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_user_teams (
    user_id TEXT PRIMARY KEY,
    team_id INTEGER REFERENCES teams(id)
);
";

/// Base tables for the networked engine: native JSONB, TIMESTAMPTZ, INET.
const BASE_TABLES_POSTGRES: &str = "
CREATE TABLE IF NOT EXISTS event_types (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS telemetry_events (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL REFERENCES event_types(id),
    timestamp TIMESTAMPTZ NOT NULL,
    server_id TEXT,
    version TEXT,
    session_id TEXT,
    user_id TEXT,
    data JSONB,
    received_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS orgs (
    server_id TEXT PRIMARY KEY,
    company_name TEXT
);

CREATE TABLE IF NOT EXISTS teams (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    color TEXT
);

CREATE TABLE IF NOT EXISTS people (
    id BIGSERIAL PRIMARY KEY,
    display_name TEXT NOT NULL,
    email TEXT
);

CREATE TABLE IF NOT EXISTS people_usernames (
    id BIGSERIAL PRIMARY KEY,
    person_id BIGINT NOT NULL REFERENCES people(id) ON DELETE CASCADE,
    username TEXT NOT NULL,
    org_id TEXT,
    UNIQUE (person_id, username)
);

CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'basic',
    last_login TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS remember_tokens (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TIMESTAMPTZ NOT NULL,
    revoked_at TIMESTAMPTZ,
    user_agent TEXT,
    ip TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS login_audit (
    id BIGSERIAL PRIMARY KEY,
    username TEXT NOT NULL,
    success BOOLEAN NOT NULL,
    ip INET,
    user_agent TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS user_event_stats (
    user_id TEXT PRIMARY KEY,
    count BIGINT NOT NULL DEFAULT 0,
    last_event TIMESTAMPTZ,
    display_name TEXT
);

CREATE TABLE IF NOT EXISTS org_event_stats (
    org_id TEXT PRIMARY KEY,
    count BIGINT NOT NULL DEFAULT 0,
    last_event TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_user_teams (
    user_id TEXT PRIMARY KEY,
    team_id BIGINT REFERENCES teams(id)
);
";

/// Run all pending schema work. Safe to call on every start.
pub fn run(db: &Database, config: &Config) -> Result<()> {
    tracing::info!(backend = db.kind().as_str(), "Checking database schema");

    create_base_tables(db)?;
    seed_event_types(db)?;
    migrate_legacy_event_column(db)?;
    ensure_event_columns(db)?;
    ensure_people_columns(db)?;
    ensure_org_team_columns(db)?;
    ensure_indexes(db)?;
    seed_operator_account(db, config)?;

    tracing::info!("Schema up to date");
    Ok(())
}

fn create_base_tables(db: &Database) -> Result<()> {
    let ddl = match db.kind() {
        BackendKind::Sqlite => BASE_TABLES_SQLITE,
        BackendKind::Postgres => BASE_TABLES_POSTGRES,
    };
    db.backend()?.execute_batch(ddl)
}

const SEED_EVENT_TYPE: Sql = Sql {
    sqlite: "INSERT OR IGNORE INTO event_types (name) VALUES (?1)",
    postgres: "INSERT INTO event_types (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
};

fn seed_event_types(db: &Database) -> Result<()> {
    for event_type in CANONICAL_EVENT_TYPES {
        db.execute(&SEED_EVENT_TYPE, &sql_params![event_type.as_str()])?;
    }
    Ok(())
}

/// Fold the legacy `event` text column into `event_id`.
///
/// Rows are joined to `event_types` by name; anything unmatched becomes
/// `custom`. The legacy column and its index are then dropped. On the
/// networked backend the whole step runs in one transaction.
fn migrate_legacy_event_column(db: &Database) -> Result<()> {
    if !column_exists(db, "telemetry_events", "event")? {
        return Ok(());
    }

    tracing::info!("Migrating legacy event column to event_id");

    // Databases that predate event_id entirely
    add_column_if_missing(
        db,
        "telemetry_events",
        "event_id",
        &Sql {
            sqlite: "INTEGER REFERENCES event_types(id)",
            postgres: "BIGINT REFERENCES event_types(id)",
        },
    )?;

    match db.kind() {
        BackendKind::Sqlite => {
            let backend = db.backend()?;
            backend.execute(
                "UPDATE telemetry_events
                 SET event_id = (SELECT id FROM event_types WHERE name = telemetry_events.event)
                 WHERE event_id IS NULL",
                &[],
            )?;
            backend.execute(
                "UPDATE telemetry_events
                 SET event_id = (SELECT id FROM event_types WHERE name = 'custom')
                 WHERE event_id IS NULL",
                &[],
            )?;
            backend.execute("DROP INDEX IF EXISTS idx_event", &[])?;
            backend.execute("ALTER TABLE telemetry_events DROP COLUMN event", &[])?;
        }
        BackendKind::Postgres => {
            let mut tx = db.transaction()?;
            tx.execute(
                "UPDATE telemetry_events
                 SET event_id = et.id
                 FROM event_types et
                 WHERE telemetry_events.event = et.name
                   AND telemetry_events.event_id IS NULL",
                &[],
            )?;
            tx.execute(
                "UPDATE telemetry_events
                 SET event_id = (SELECT id FROM event_types WHERE name = 'custom')
                 WHERE event_id IS NULL",
                &[],
            )?;
            tx.execute(
                "ALTER TABLE telemetry_events ALTER COLUMN event_id SET NOT NULL",
                &[],
            )?;
            tx.execute("DROP INDEX IF EXISTS idx_event", &[])?;
            tx.execute("ALTER TABLE telemetry_events DROP COLUMN event", &[])?;
            tx.commit()?;
        }
    }

    Ok(())
}

/// Denormalized, lifecycle and schema-v2 columns on the fact table.
fn ensure_event_columns(db: &Database) -> Result<()> {
    let columns: &[(&str, Sql)] = &[
        ("org_id", Sql::same("TEXT")),
        ("user_name", Sql::same("TEXT")),
        ("tool_name", Sql::same("TEXT")),
        ("company_name", Sql::same("TEXT")),
        ("error_message", Sql::same("TEXT")),
        (
            "team_id",
            Sql {
                sqlite: "INTEGER",
                postgres: "BIGINT",
            },
        ),
        (
            "deleted_at",
            Sql {
                sqlite: "TEXT",
                postgres: "TIMESTAMPTZ",
            },
        ),
        ("area", Sql::same("TEXT")),
        (
            "success",
            Sql {
                sqlite: "INTEGER NOT NULL DEFAULT 1",
                postgres: "BOOLEAN NOT NULL DEFAULT TRUE",
            },
        ),
        (
            "telemetry_schema_version",
            Sql {
                sqlite: "INTEGER",
                postgres: "INTEGER",
            },
        ),
        ("parent_session_id", Sql::same("TEXT")),
    ];

    for (name, decl) in columns.iter() {
        add_column_if_missing(db, "telemetry_events", name, decl)?;
    }
    Ok(())
}

fn ensure_people_columns(db: &Database) -> Result<()> {
    add_column_if_missing(db, "people", "initials", &Sql::same("TEXT"))
}

fn ensure_org_team_columns(db: &Database) -> Result<()> {
    add_column_if_missing(db, "orgs", "alias", &Sql::same("TEXT"))?;
    add_column_if_missing(db, "orgs", "color", &Sql::same("TEXT"))?;
    add_column_if_missing(
        db,
        "orgs",
        "team_id",
        &Sql {
            sqlite: "INTEGER REFERENCES teams(id)",
            postgres: "BIGINT REFERENCES teams(id)",
        },
    )?;
    add_column_if_missing(
        db,
        "teams",
        "logo_data",
        &Sql {
            sqlite: "BLOB",
            postgres: "BYTEA",
        },
    )?;
    add_column_if_missing(db, "teams", "logo_mime", &Sql::same("TEXT"))?;
    Ok(())
}

/// Composite indexes used by the query engine, plus the JSON expression
/// and partial indexes the networked engine supports. Single-column
/// indexes that are strict prefixes of a composite are dropped.
fn ensure_indexes(db: &Database) -> Result<()> {
    let backend = db.backend()?;

    const COMPOSITES: &[(&str, &str)] = &[
        ("idx_events_event_created", "telemetry_events(event_id, created_at)"),
        ("idx_events_user_created", "telemetry_events(user_id, created_at)"),
        ("idx_events_team_created", "telemetry_events(team_id, created_at)"),
        ("idx_events_deleted_created", "telemetry_events(deleted_at, created_at)"),
        ("idx_events_parent_ts", "telemetry_events(parent_session_id, timestamp)"),
        ("idx_events_session_ts", "telemetry_events(session_id, timestamp)"),
        ("idx_people_usernames_username", "people_usernames(username)"),
        ("idx_remember_tokens_user", "remember_tokens(user_id)"),
        ("idx_login_audit_created", "login_audit(created_at)"),
    ];

    for (name, target) in COMPOSITES {
        backend.execute(
            &format!("CREATE INDEX IF NOT EXISTS {} ON {}", name, target),
            &[],
        )?;
    }

    if db.kind() == BackendKind::Postgres {
        const EXPRESSIONS: &[&str] = &[
            "CREATE INDEX IF NOT EXISTS idx_events_data_org ON telemetry_events ((data->>'orgId'))",
            "CREATE INDEX IF NOT EXISTS idx_events_data_user ON telemetry_events ((data->>'userName'))",
            "CREATE INDEX IF NOT EXISTS idx_events_data_tool ON telemetry_events ((data->>'toolName'))",
            "CREATE INDEX IF NOT EXISTS idx_events_active ON telemetry_events (timestamp) WHERE deleted_at IS NULL",
        ];
        for sql in EXPRESSIONS {
            backend.execute(sql, &[])?;
        }
    }

    // Redundant single-column prefixes from earlier releases
    const STALE: &[&str] = &[
        "idx_created_at",
        "idx_event",
        "idx_session_id",
        "idx_user_id",
        "idx_timestamp",
        "idx_deleted_at",
        "idx_parent_session_id",
    ];
    for name in STALE {
        backend.execute(&format!("DROP INDEX IF EXISTS {}", name), &[])?;
    }

    Ok(())
}

const SEED_OPERATOR: Sql = Sql {
    sqlite: "INSERT OR IGNORE INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
    postgres: "INSERT INTO users (username, password_hash, role) VALUES ($1, $2, $3)
               ON CONFLICT (username) DO NOTHING",
};

fn seed_operator_account(db: &Database, config: &Config) -> Result<()> {
    let (Some(username), Some(password)) = (
        config.operator.username.as_deref(),
        config.operator.password.as_deref(),
    ) else {
        return Ok(());
    };

    let hash = super::identity::hash_password(password)?;
    let inserted = db.execute(
        &SEED_OPERATOR,
        &sql_params![username, hash, config.operator.role().as_str()],
    )?;
    if inserted > 0 {
        tracing::info!(username, "Seeded operator account");
    }
    Ok(())
}

// ============================================
// Introspection guards
// ============================================

const TABLE_EXISTS: Sql = Sql {
    sqlite: "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?1",
    postgres: "SELECT COUNT(*) AS n FROM information_schema.tables
               WHERE table_schema = current_schema() AND table_name = $1",
};

pub(crate) fn table_exists(db: &Database, table: &str) -> Result<bool> {
    let row = db.query_one(&TABLE_EXISTS, &sql_params![table])?;
    Ok(row.map(|r| r.get_i64("n").unwrap_or(0) > 0).unwrap_or(false))
}

const COLUMN_EXISTS: Sql = Sql {
    sqlite: "SELECT COUNT(*) AS n FROM pragma_table_info(?1) WHERE name = ?2",
    postgres: "SELECT COUNT(*) AS n FROM information_schema.columns
               WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
};

pub(crate) fn column_exists(db: &Database, table: &str, column: &str) -> Result<bool> {
    let row = db.query_one(&COLUMN_EXISTS, &sql_params![table, column])?;
    Ok(row.map(|r| r.get_i64("n").unwrap_or(0) > 0).unwrap_or(false))
}

fn add_column_if_missing(db: &Database, table: &str, column: &str, decl: &Sql) -> Result<()> {
    if column_exists(db, table, column)? {
        return Ok(());
    }
    tracing::info!(table, column, "Adding column");
    db.backend()?.execute(
        &format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table,
            column,
            decl.for_kind(db.kind())
        ),
        &[],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn open_raw(dir: &std::path::Path) -> (Database, Config) {
        let mut config = Config::default();
        config.database.path = dir.join("schema.db");
        (Database::open(&config).unwrap(), config)
    }

    #[test]
    fn test_schema_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (db, config) = open_raw(dir.path());

        run(&db, &config).unwrap();
        run(&db, &config).unwrap();

        for table in [
            "event_types",
            "telemetry_events",
            "orgs",
            "teams",
            "people",
            "people_usernames",
            "users",
            "remember_tokens",
            "login_audit",
            "user_event_stats",
            "org_event_stats",
            "settings",
            "event_user_teams",
        ] {
            assert!(table_exists(&db, table).unwrap(), "table {} should exist", table);
        }
    }

    #[test]
    fn test_event_types_seeded_once() {
        let dir = tempfile::tempdir().unwrap();
        let (db, config) = open_raw(dir.path());
        run(&db, &config).unwrap();
        run(&db, &config).unwrap();

        let rows = db
            .backend()
            .unwrap()
            .query("SELECT COUNT(*) AS n FROM event_types", &[])
            .unwrap();
        assert_eq!(rows[0].get_i64("n").unwrap(), 6);
    }

    #[test]
    fn test_denormalized_columns_added() {
        let dir = tempfile::tempdir().unwrap();
        let (db, config) = open_raw(dir.path());
        run(&db, &config).unwrap();

        for column in [
            "org_id",
            "user_name",
            "tool_name",
            "company_name",
            "error_message",
            "team_id",
            "deleted_at",
            "area",
            "success",
            "telemetry_schema_version",
            "parent_session_id",
        ] {
            assert!(
                column_exists(&db, "telemetry_events", column).unwrap(),
                "column {} should exist",
                column
            );
        }
        assert!(column_exists(&db, "people", "initials").unwrap());
        assert!(column_exists(&db, "teams", "logo_data").unwrap());
        assert!(column_exists(&db, "orgs", "team_id").unwrap());
    }

    #[test]
    fn test_legacy_event_column_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let (db, config) = open_raw(dir.path());

        // A database from before event_id existed
        db.backend()
            .unwrap()
            .execute_batch(
                "CREATE TABLE event_types (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL UNIQUE
                 );
                 CREATE TABLE telemetry_events (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     event TEXT,
                     event_id INTEGER REFERENCES event_types(id),
                     timestamp TEXT NOT NULL,
                     server_id TEXT,
                     version TEXT,
                     session_id TEXT,
                     user_id TEXT,
                     data TEXT,
                     received_at TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 INSERT INTO event_types (name) VALUES ('tool_call');
                 INSERT INTO telemetry_events (event, timestamp, received_at, created_at)
                 VALUES ('tool_call', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z');
                 INSERT INTO telemetry_events (event, timestamp, received_at, created_at)
                 VALUES ('server_boot', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z');",
            )
            .unwrap();

        run(&db, &config).unwrap();

        assert!(!column_exists(&db, "telemetry_events", "event").unwrap());

        let rows = db
            .backend()
            .unwrap()
            .query(
                "SELECT et.name AS name FROM telemetry_events e
                 JOIN event_types et ON et.id = e.event_id
                 ORDER BY e.id",
                &[],
            )
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get_str("name").unwrap()).collect();
        assert_eq!(names, vec!["tool_call", "custom"]);
    }

    #[test]
    fn test_operator_seeded_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (db, mut config) = open_raw(dir.path());
        config.operator.username = Some("copilot".to_string());
        config.operator.password = Some("hunter2".to_string());
        config.operator.role = Some("GOD".to_string());

        run(&db, &config).unwrap();
        run(&db, &config).unwrap();

        let rows = db
            .backend()
            .unwrap()
            .query("SELECT role, COUNT(*) OVER () AS n FROM users WHERE username = 'copilot'", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("role").unwrap(), "god");
        assert_eq!(rows[0].get_i64("n").unwrap(), 1);
    }
}
