use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

pub const LOG_FILE_PREFIX: &str = "agent.log";

/// Installs the global subscriber: stderr plus a daily-rotated file in `dir`.
///
/// A log directory that cannot be used leaves stderr as the only output; the
/// reason is logged once the subscriber is up. The returned guard, if any,
/// flushes the file writer on drop and must be held by `main` for the
/// lifetime of the process.
pub fn init_tracing(cfg: &LoggingConfig, dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.level.clone());

    let (file_layer, guard, file_error) = match file_appender(dir) {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if cfg.json {
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(file_writer)
                    .boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(file_writer).boxed()
            };
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    if let Some(e) = file_error {
        warn!(error = %format!("{e:#}"), "file logging disabled, logging to stderr only");
    }
    Ok(guard)
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(dir)
        .with_context(|| format!("opening log file in {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appender_opens_in_writable_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_appender(dir.path()).is_ok());
    }

    #[test]
    fn appender_failure_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        assert!(file_appender(&blocker).is_err());
    }
}
