//! # toolscope-core
//!
//! Core library for toolscope - a telemetry ingestion and analytics
//! service for developer-tool usage events.
//!
//! This library provides:
//! - Payload parsing and normalization across two client schema versions
//! - Logical session reconciliation (the 4-hour linking rule)
//! - A storage layer with embedded (SQLite) and networked (PostgreSQL)
//!   backends behind one trait
//! - Idempotent schema bootstrap with guarded forward-only migrations
//! - Aggregate counters, trash lifecycle, identity/team services and
//!   full-database export/import
//!
//! ## Architecture
//!
//! Data flows through the ingest pipeline into one relational schema:
//! - **Ingest:** parse → validate (quarantining rejects) → reconcile
//!   parent session → insert → best-effort counter updates
//! - **Query:** listing, logical sessions, daily series and top-N answer
//!   from the fact table; counters serve the dashboards
//! - **Lifecycle:** soft delete is a reversible undo buffer; only
//!   permanent deletion repairs counters
//!
//! ## Example
//!
//! ```rust,no_run
//! use toolscope_core::{Config, Database, Ingestor};
//!
//! let config = Config::from_env();
//! let db = Database::bootstrap(&config).expect("failed to open database");
//!
//! let ingestor = Ingestor::new(db.clone(), &config);
//! let outcome = ingestor.ingest(&serde_json::json!({
//!     "event": "session_start",
//!     "timestamp": "2025-01-01T09:00:00Z",
//!     "serverId": "org-1",
//!     "sessionId": "s1",
//!     "userId": "u1",
//!     "data": {}
//! }));
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::events::EventFilter;
pub use db::Database;
pub use error::{Error, Result};
pub use ingest::{BatchSummary, IngestOutcome, Ingestor};
pub use types::*;

// Public modules
pub mod backfill;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod types;
