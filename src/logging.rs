use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV: &str = "LIBRETTO_LOG";
const DEFAULT_FILTER: &str = "libretto=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "libretto.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber: human-readable lines on stderr plus JSON
/// lines in a daily file under `log_dir`. Later calls are no-ops.
pub fn init(log_dir: Option<&Path>) -> anyhow::Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }
    let _ = tracing_log::LogTracer::init();

    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
        return Ok(());
    };

    fs::create_dir_all(dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339());

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if installed.is_ok() {
        let _ = FILE_GUARD.set(guard);
    }
    Ok(())
}
