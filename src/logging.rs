//! Tracing subscriber setup for the binaries.
//!
//! Logs go to stderr and, optionally, to a file through a non-blocking writer.
//! The log file is truncated at startup, so it only holds the current run.
//! `RUST_LOG` takes precedence over the level passed on the command line.

use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map a command-line verbosity (`debug`, `info`, `warning`, `error`, ...) to
/// a filter level.
pub fn parse_level(verbosity: &str) -> Result<&'static str> {
    match verbosity.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(anyhow!(
            "didn't recognize logging level [{other}]; options are: debug, info, warning, error"
        )),
    }
}

/// Create `path` (and its parent directories), truncating an existing file.
pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("cannot create log directory {}: {e}", dir.display()))?;
    }
    File::create(path).map_err(|e| anyhow!("cannot open log file {}: {e}", path.display()))
}

/// Install the global subscriber.
///
/// The returned guard must be kept alive for the file writer to flush.
pub fn init_tracing(verbosity: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = parse_level(verbosity)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_names() {
        assert_eq!(parse_level("DEBUG").unwrap(), "debug");
        assert_eq!(parse_level("warning").unwrap(), "warn");
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn log_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("inserv.log");

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "previous run\n").unwrap();
        drop(open_log_file(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let fresh = dir.path().join("nested").join("new.log");
        open_log_file(&fresh).unwrap();
        assert!(fresh.exists());
    }
}
