//! Error types for toolscope-core

use thiserror::Error;

/// Per-event validation failures.
///
/// These never abort a batch: the offending event is quarantined and the
/// remaining events continue through ingest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Payload is not a JSON object or could not be parsed at all
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Neither schema v1 nor v2 markers were recognized
    #[error("unknown telemetry schema")]
    UnknownSchema,

    /// A field required by the ingest rules is missing
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),
}

/// Main error type for the toolscope-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Storage used before `Database::open` or after `close`
    #[error("storage is unavailable: not initialized or already closed")]
    StorageUnavailable,

    /// Underlying database I/O failure; any open transaction is rolled back
    #[error("storage backend error: {0}")]
    StorageBackend(String),

    /// Per-event validation failure, routed to quarantine
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unique-constraint violation (team name, person-username, token hash)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Recoverable background failure (backfill, v2 migration); retried on next start
    #[error("transient error: {0}")]
    Transient(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref msg) = e {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return Error::Conflict(
                    msg.clone().unwrap_or_else(|| "unique constraint violation".to_string()),
                );
            }
        }
        Error::StorageBackend(e.to_string())
    }
}

impl From<postgres::Error> for Error {
    fn from(e: postgres::Error) -> Self {
        if let Some(db_err) = e.as_db_error() {
            // 23505 = unique_violation
            if db_err.code().code() == "23505" {
                return Error::Conflict(db_err.message().to_string());
            }
        }
        Error::StorageBackend(e.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::StorageBackend(e.to_string())
    }
}

/// Result type alias for toolscope-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let e = Error::Validation(ValidationError::UnknownSchema);
        assert_eq!(e.to_string(), "validation error: unknown telemetry schema");
    }

    #[test]
    fn test_missing_field_display() {
        let e = ValidationError::MissingRequiredField("userId");
        assert_eq!(e.to_string(), "missing required field: userId");
    }
}
