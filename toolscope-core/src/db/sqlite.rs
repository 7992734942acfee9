//! Embedded storage backend (SQLite)
//!
//! Connections come from an r2d2 pool; every connection gets the
//! performance pragmas applied on checkout and keeps a prepared-statement
//! cache keyed by SQL text (finalized when the connection drops out of the
//! pool).

use super::{BackendKind, SqlRow, SqlValue, StorageBackend, StorageTransaction};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value, ValueRef};
use rusqlite::CachedStatement;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const POOL_MAX: u32 = 20;
const POOL_MIN_IDLE: u32 = 2;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// WAL journal, relaxed sync, 64 MiB page cache, 256 MiB mmap window,
/// in-memory temp tables. Writers queue behind the busy timeout.
const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -65536;
    PRAGMA mmap_size = 268435456;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 10000;
    PRAGMA foreign_keys = ON;
";

pub struct SqliteBackend {
    pool: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteBackend {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // First boot may start from a template database
        if !config.path.exists() {
            if let Some(template) = &config.template_path {
                if template.exists() {
                    std::fs::copy(template, &config.path)?;
                    tracing::info!(
                        template = %template.display(),
                        path = %config.path.display(),
                        "Copied template database"
                    );
                }
            }
        }

        let manager = SqliteConnectionManager::file(&config.path).with_init(|conn| {
            conn.execute_batch(PRAGMAS)?;
            conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
            Ok(())
        });

        let pool = r2d2::Pool::builder()
            .max_size(POOL_MAX)
            .min_idle(Some(POOL_MIN_IDLE))
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connection_timeout(ACQUIRE_TIMEOUT)
            .build(manager)?;

        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(Error::from)
    }
}

fn to_sqlite_value(v: &SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Json(j) => Value::Text(j.to_string()),
        SqlValue::Timestamp(t) => Value::Text(super::fmt_ts(t)),
        SqlValue::Bool(b) => Value::Integer(*b as i64),
    }
}

fn from_sqlite_value(v: ValueRef<'_>) -> SqlValue {
    match v {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(s) => SqlValue::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
    }
}

/// Run a query on a prepared statement, converting every row.
fn collect_rows(
    stmt: &mut CachedStatement<'_>,
    params: &[SqlValue],
    mut on_row: impl FnMut(SqlRow) -> Result<()>,
) -> Result<()> {
    let columns: Arc<Vec<String>> = Arc::new(
        stmt.column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect(),
    );

    let bound: Vec<Value> = params.iter().map(to_sqlite_value).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;

    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_sqlite_value(row.get_ref(i)?));
        }
        on_row(SqlRow::new(columns.clone(), values))?;
    }

    Ok(())
}

fn execute_on(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64> {
    let mut stmt = conn.prepare_cached(sql)?;
    let bound: Vec<Value> = params.iter().map(to_sqlite_value).collect();
    let affected = stmt.execute(rusqlite::params_from_iter(bound))?;
    Ok(affected as u64)
}

fn query_on(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<SqlRow>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut out = Vec::new();
    collect_rows(&mut stmt, params, |row| {
        out.push(row);
        Ok(())
    })?;
    Ok(out)
}

fn insert_on(conn: &rusqlite::Connection, sql: &str, params: &[SqlValue]) -> Result<i64> {
    let rows = query_on(conn, sql, params)?;
    match rows.first().map(|r| r.first()).transpose()? {
        Some(SqlValue::Integer(id)) => Ok(*id),
        _ => Err(Error::StorageBackend(format!(
            "insert did not return an id: {}",
            sql
        ))),
    }
}

impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let conn = self.conn()?;
        execute_on(&conn, sql, params)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql).map_err(Error::from)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let conn = self.conn()?;
        query_on(&conn, sql, params)
    }

    fn query_streamed(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(SqlRow) -> Result<()>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        collect_rows(&mut stmt, params, on_row)
    }

    fn insert(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        let conn = self.conn()?;
        insert_on(&conn, sql, params)
    }

    fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
        let mut tx = self.transaction()?;
        let mut affected = 0;
        for row in rows {
            affected += tx.execute(sql, row)?;
        }
        tx.commit()?;
        Ok(affected)
    }

    fn transaction(&self) -> Result<Box<dyn StorageTransaction>> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction { conn, done: false }))
    }

    fn size_bytes(&self) -> Result<u64> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok((page_count * page_size) as u64)
    }

    fn close(&self) -> Result<()> {
        // Pooled connections finalize their cached statements on drop; the
        // pool itself drains when the backend is dropped.
        tracing::debug!(path = %self.path.display(), "Closing embedded backend");
        Ok(())
    }
}

struct SqliteTransaction {
    conn: PooledConnection<SqliteConnectionManager>,
    done: bool,
}

impl StorageTransaction for SqliteTransaction {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        execute_on(&self.conn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        query_on(&self.conn, sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        insert_on(&self.conn, sql, params)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback on drop failed");
            }
        }
    }
}
