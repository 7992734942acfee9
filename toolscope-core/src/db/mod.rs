//! Storage layer for toolscope
//!
//! One relational schema, two physical engines: an embedded single-file
//! database (SQLite) and a networked cluster-grade database (PostgreSQL).
//! The [`StorageBackend`] trait carries exactly the operations the rest of
//! the crate needs; each engine implements it with its own hand-written
//! statements. Dialects are not abstracted — where SQL diverges, both
//! variants are written out and selected by [`BackendKind`].
//!
//! Query modules are organized by domain:
//! - `schema` - bootstrap and forward-only migrations
//! - `events` - event listing, sessions, time series, top-N
//! - `stats` - user/org aggregate counters
//! - `lifecycle` - the trash (soft delete, recover, purge)
//! - `identity` - people, teams, orgs, operator accounts, tokens
//! - `export` - full-database export/import

pub mod events;
pub mod export;
pub mod identity;
pub mod lifecycle;
mod postgres;
pub mod schema;
mod sqlite;
pub mod stats;

use crate::config::{Config, DbType};
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which engine a [`Database`] is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgresql",
        }
    }
}

// ============================================
// Values and rows
// ============================================

/// A parameter or column value crossing the backend boundary.
///
/// JSON is stored as text on the embedded engine and as JSONB on the
/// networked engine; timestamps as RFC 3339 text vs TIMESTAMPTZ. Each
/// backend maps the variants onto its native types.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Bytes(v.to_vec())
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

/// Build a `Vec<SqlValue>` parameter list from heterogeneous Rust values.
#[macro_export]
macro_rules! sql_params {
    () => { Vec::<$crate::db::SqlValue>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::db::SqlValue::from($v)),+] };
}

/// One result row, addressable by column name.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub(crate) fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    fn value_ref(&self, name: &str) -> Result<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
            .ok_or_else(|| Error::StorageBackend(format!("no such column in result: {}", name)))
    }

    /// Raw access to a column's value, untyped.
    pub fn value(&self, name: &str) -> Result<&SqlValue> {
        self.value_ref(name)
    }

    /// The first column of the row, for single-value queries.
    pub fn first(&self) -> Result<&SqlValue> {
        self.values
            .first()
            .ok_or_else(|| Error::StorageBackend("empty result row".to_string()))
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        self.get_opt_i64(name)?
            .ok_or_else(|| Error::StorageBackend(format!("unexpected NULL in column {}", name)))
    }

    pub fn get_opt_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.value_ref(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(i) => Ok(Some(*i)),
            SqlValue::Real(f) => Ok(Some(*f as i64)),
            SqlValue::Bool(b) => Ok(Some(*b as i64)),
            other => Err(Error::StorageBackend(format!(
                "column {} is not an integer: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<f64> {
        match self.value_ref(name)? {
            SqlValue::Integer(i) => Ok(*i as f64),
            SqlValue::Real(f) => Ok(*f),
            other => Err(Error::StorageBackend(format!(
                "column {} is not numeric: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<String> {
        self.get_opt_str(name)?
            .ok_or_else(|| Error::StorageBackend(format!("unexpected NULL in column {}", name)))
    }

    pub fn get_opt_str(&self, name: &str) -> Result<Option<String>> {
        match self.value_ref(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Integer(i) => Ok(Some(i.to_string())),
            SqlValue::Timestamp(t) => Ok(Some(fmt_ts(t))),
            other => Err(Error::StorageBackend(format!(
                "column {} is not text: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.value_ref(name)? {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Integer(i) => Ok(*i != 0),
            SqlValue::Null => Ok(false),
            other => Err(Error::StorageBackend(format!(
                "column {} is not a boolean: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_datetime(&self, name: &str) -> Result<DateTime<Utc>> {
        self.get_opt_datetime(name)?
            .ok_or_else(|| Error::StorageBackend(format!("unexpected NULL in column {}", name)))
    }

    pub fn get_opt_datetime(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.value_ref(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Timestamp(t) => Ok(Some(*t)),
            SqlValue::Text(s) => Ok(parse_ts(s)),
            other => Err(Error::StorageBackend(format!(
                "column {} is not a timestamp: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_json(&self, name: &str) -> Result<serde_json::Value> {
        match self.value_ref(name)? {
            SqlValue::Null => Ok(serde_json::Value::Null),
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::Text(s) => {
                Ok(serde_json::from_str(s).unwrap_or(serde_json::Value::Null))
            }
            other => Err(Error::StorageBackend(format!(
                "column {} is not JSON: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_opt_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.value_ref(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Bytes(b) => Ok(Some(b.clone())),
            other => Err(Error::StorageBackend(format!(
                "column {} is not bytes: {:?}",
                name, other
            ))),
        }
    }
}

/// Canonical timestamp encoding for the embedded backend: RFC 3339 UTC with
/// millisecond precision, so lexicographic order equals time order.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

// ============================================
// Backend trait
// ============================================

/// Uniform operations over the two storage engines.
///
/// Placeholders are positional: `?1..?N` on SQLite, `$1..$N` on Postgres.
/// `insert` statements must end in `RETURNING id` (both engines support it).
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run a statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a multi-statement script (DDL only; no parameters).
    fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Run a query, materializing all rows.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Run a query, invoking the callback per row without materializing the
    /// full result set.
    fn query_streamed(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(SqlRow) -> Result<()>,
    ) -> Result<()>;

    /// Run an `INSERT ... RETURNING id`, returning the new row id.
    fn insert(&self, sql: &str, params: &[SqlValue]) -> Result<i64>;

    /// Run one statement for every parameter row, inside a single
    /// transaction.
    fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64>;

    /// Begin a transaction. The returned object rolls back on drop unless
    /// committed.
    fn transaction(&self) -> Result<Box<dyn StorageTransaction>>;

    /// Bytes currently used by the database.
    fn size_bytes(&self) -> Result<u64>;

    /// Release pooled connections, finalizing cached statements.
    fn close(&self) -> Result<()>;

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }
}

/// An open transaction on one pooled connection.
///
/// Dropping without `commit` rolls the transaction back.
pub trait StorageTransaction: Send {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;
    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;

    fn query_one(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }
}

// ============================================
// Dialect-paired statements
// ============================================

/// A statement hand-written once per dialect.
#[derive(Debug, Clone, Copy)]
pub struct Sql {
    pub sqlite: &'static str,
    pub postgres: &'static str,
}

impl Sql {
    /// Both dialects share the text (placeholder-free or DDL-identical).
    pub const fn same(sql: &'static str) -> Self {
        Sql {
            sqlite: sql,
            postgres: sql,
        }
    }

    pub fn for_kind(&self, kind: BackendKind) -> &'static str {
        match kind {
            BackendKind::Sqlite => self.sqlite,
            BackendKind::Postgres => self.postgres,
        }
    }
}

/// Incremental builder for dynamically-filtered queries.
///
/// Tracks the positional placeholder counter so fragments stay valid for
/// whichever dialect the database runs on.
pub(crate) struct QueryBuilder {
    kind: BackendKind,
    sql: String,
    params: Vec<SqlValue>,
}

impl QueryBuilder {
    pub fn new(kind: BackendKind, base: &str) -> Self {
        Self {
            kind,
            sql: base.to_string(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    /// Register a parameter and return its placeholder text.
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> String {
        self.params.push(value.into());
        let n = self.params.len();
        match self.kind {
            BackendKind::Sqlite => format!("?{}", n),
            BackendKind::Postgres => format!("${}", n),
        }
    }

    /// Register parameters for an `IN (...)` list and return `(p1, p2, ...)`.
    pub fn bind_list<I, T>(&mut self, values: I) -> String
    where
        I: IntoIterator<Item = T>,
        T: Into<SqlValue>,
    {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.bind(v)).collect();
        format!("({})", placeholders.join(", "))
    }

    pub fn finish(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.params)
    }
}

// ============================================
// Database facade
// ============================================

struct DatabaseInner {
    backend: Box<dyn StorageBackend>,
    closed: AtomicBool,
    max_size_bytes: u64,
}

/// Handle to the configured storage backend.
///
/// Cheap to clone; all clones share the underlying pool. After [`close`],
/// every operation fails with `StorageUnavailable`.
///
/// [`close`]: Database::close
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open the backend selected by the configuration.
    pub fn open(config: &Config) -> Result<Self> {
        let backend: Box<dyn StorageBackend> = match config.database.db_type {
            DbType::Sqlite => Box::new(sqlite::SqliteBackend::open(&config.database)?),
            DbType::Postgresql => Box::new(postgres::PostgresBackend::open(&config.database)?),
        };

        tracing::info!(backend = backend.kind().as_str(), "Storage opened");

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                backend,
                closed: AtomicBool::new(false),
                max_size_bytes: config.database.max_size_bytes,
            }),
        })
    }

    /// Open the backend, run schema bootstrap/migrations, backfill empty
    /// aggregate tables and kick off the background backfill workers.
    pub fn bootstrap(config: &Config) -> Result<Self> {
        let db = Self::open(config)?;
        schema::run(&db, config)?;
        db.backfill_stats_if_empty()?;
        crate::backfill::spawn_all(db.clone());
        Ok(db)
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// The configured soft maximum database size in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.inner.max_size_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the backend. Cached statements are finalized as pooled
    /// connections are released; subsequent operations fail with
    /// `StorageUnavailable`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.backend.close()
    }

    pub(crate) fn backend(&self) -> Result<&dyn StorageBackend> {
        if self.is_closed() {
            return Err(Error::StorageUnavailable);
        }
        Ok(self.inner.backend.as_ref())
    }

    /// Select the dialect variant of a paired statement.
    pub(crate) fn sql(&self, statement: &Sql) -> &'static str {
        statement.for_kind(self.kind())
    }

    pub(crate) fn execute(&self, statement: &Sql, params: &[SqlValue]) -> Result<u64> {
        self.backend()?.execute(self.sql(statement), params)
    }

    pub(crate) fn query(&self, statement: &Sql, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.backend()?.query(self.sql(statement), params)
    }

    pub(crate) fn query_one(
        &self,
        statement: &Sql,
        params: &[SqlValue],
    ) -> Result<Option<SqlRow>> {
        self.backend()?.query_one(self.sql(statement), params)
    }

    pub(crate) fn insert(&self, statement: &Sql, params: &[SqlValue]) -> Result<i64> {
        self.backend()?.insert(self.sql(statement), params)
    }

    pub(crate) fn transaction(&self) -> Result<Box<dyn StorageTransaction>> {
        self.backend()?.transaction()
    }

    /// Bytes used by the backend right now.
    pub fn size_bytes(&self) -> Result<u64> {
        self.backend()?.size_bytes()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::Path;

    /// Open a throwaway on-disk database for tests.
    pub fn open_test_db(dir: &Path) -> Database {
        let mut config = Config::default();
        config.database.path = dir.join("test.db");
        let db = Database::open(&config).expect("open test db");
        schema::run(&db, &config).expect("bootstrap schema");
        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_from_option() {
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(
            SqlValue::from(Some("x".to_string())),
            SqlValue::Text("x".to_string())
        );
    }

    #[test]
    fn test_fmt_ts_is_sortable() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(1);
        assert!(fmt_ts(&earlier) < fmt_ts(&later));
    }

    #[test]
    fn test_parse_ts_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(&now)).unwrap();
        assert_eq!(fmt_ts(&parsed), fmt_ts(&now));
    }

    #[test]
    fn test_query_builder_placeholders() {
        let mut qb = QueryBuilder::new(BackendKind::Sqlite, "SELECT 1 WHERE a = ");
        let p = qb.bind(1i64);
        qb.push(&p);
        let (sql, params) = qb.finish();
        assert_eq!(sql, "SELECT 1 WHERE a = ?1");
        assert_eq!(params.len(), 1);

        let mut qb = QueryBuilder::new(BackendKind::Postgres, "");
        assert_eq!(qb.bind("x"), "$1");
        assert_eq!(qb.bind_list(vec![1i64, 2, 3]), "($2, $3, $4)");
    }

    #[test]
    fn test_closed_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_support::open_test_db(dir.path());
        db.close().unwrap();
        let err = db.size_bytes().unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable));
    }
}
