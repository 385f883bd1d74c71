use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_DIRECTIVES: &str = "info,hub=debug";

/// Installs the global subscriber writing to daily rotated files in `logs_dir`.
///
/// `RUST_LOG` overrides the default filter. The returned guard flushes the file writer on drop
/// and must be kept alive for the lifetime of the app.
pub fn setup_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    fs_err::create_dir_all(logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("vault_native")
        .filename_suffix("log")
        .build(logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .context("Failed to build log filter")?;
    let file_layer = fmt::layer()
        .with_ansi(false) // Disable ANSI colors
        .with_timer(fmt::time::LocalTime::rfc_3339())
        .with_writer(non_blocking);

    // also bridges `log` records through tracing-log
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn creates_missing_logs_directory() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        // another test may already own the global subscriber
        let _guard = setup_logging(&logs);
        assert!(logs.is_dir());
    }
}
