//! Logging initialization for embedders.
//!
//! The library itself only emits `tracing` events; a host process calls one
//! of these once at startup. Filtering follows `RUST_LOG`, defaulting to
//! `info`.

use crate::error::Result;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .init();
}

/// Log to stderr and a daily-rotated file in `dir`.
///
/// The returned guard must be held for as long as logging should keep
/// flushing; dropping it stops the background writer.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
pub fn init_logging_with_file(
    dir: impl AsRef<Path>,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let file_appender = tracing_appender::rolling::daily(dir, "calls.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(env_filter())
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_creates_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        // Initializing a global subscriber twice panics, so only verify the
        // directory side effect when another test got there first.
        match std::panic::catch_unwind(|| init_logging_with_file(&logs)) {
            Ok(Ok(_guard)) => assert!(logs.is_dir()),
            Ok(Err(e)) => panic!("init failed: {e}"),
            Err(_) => {}
        }
    }
}
