//! Log output for the service
//!
//! Two sinks: stderr is always on (the normal mode under a process
//! supervisor or container), and a daily-rotated file is added when the
//! configuration names a log directory. File writes go through a
//! non-blocking channel so ingest never stalls on log I/O.

use crate::config::LoggingConfig;
use crate::error::Result;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the background file writer alive; dropping it flushes whatever
/// is still queued. Hold it for the lifetime of the process.
pub struct LogHandle {
    file_guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// Whether a rotated log file is being written in addition to stderr.
    pub fn writes_to_file(&self) -> bool {
        self.file_guard.is_some()
    }
}

/// Install the global subscriber for this process.
///
/// The filter comes from `RUST_LOG` when set, else the configured level.
/// Calling `init` again is a no-op that leaves the first subscriber in
/// place, so embedders with their own tracing setup keep it.
pub fn init(config: &LoggingConfig) -> Result<LogHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stderr = fmt::layer().with_writer(io::stderr).compact();

    let (file, file_guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, "toolscope.log"),
            );
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            level = %config.level,
            file = file_guard.is_some(),
            "Logging initialized"
        );
    }

    Ok(LogHandle { file_guard })
}

/// Capture logs in the test harness output.
pub fn init_test() {
    let _ = fmt()
        .compact()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_without_dir_is_stderr_only() {
        let handle = init(&LoggingConfig::default()).unwrap();
        assert!(!handle.writes_to_file());
    }

    #[test]
    fn test_init_with_dir_creates_it_and_attaches_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config = LoggingConfig {
            level: "debug".to_string(),
            dir: Some(logs.clone()),
        };

        let handle = init(&config).unwrap();
        assert!(logs.is_dir());
        assert!(handle.writes_to_file());
    }

    #[test]
    fn test_init_is_reentrant() {
        init(&LoggingConfig::default()).unwrap();
        // second call must neither panic nor error
        init(&LoggingConfig::default()).unwrap();
    }
}
