//! Tracing setup: stderr plus a daily log file under `~/.logit/logs/`.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "LOGIT_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "logit-daemon.log";

/// Installs the global subscriber. The returned guard flushes the file writer
/// on drop and must live until the process exits.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir.map(prepare_log_dir) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(err)) => {
            eprintln!("Warning: {}", err);
            (None, None)
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer);
    if registry.try_init().is_err() {
        return None;
    }
    guard
}

fn env_filter() -> EnvFilter {
    if debug_enabled(env::var(DEBUG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

fn prepare_log_dir(dir: &Path) -> Result<&Path, String> {
    fs_err::create_dir_all(dir)
        .map_err(|err| format!("Failed to create log directory: {}", err))?;
    Ok(dir)
}
