//! Tracing initialisation for the server binary.
//!
//! Terminal output always; a rolling file appender under
//! `<cache>/logs/` (or the explicit `--log-file` path) when file logging is
//! possible. The guard must stay alive for the lifetime of the process.

use std::path::{Path, PathBuf};

use lemonade_router::LogLevel;
use tracing_subscriber::layer::SubscriberExt;

pub struct LoggingGuard {
    _appender: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(
    level: LogLevel,
    cache_root: &Path,
    log_file: Option<&PathBuf>,
) -> Result<LoggingGuard, String> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(
            level
                .as_filter_str()
                .parse()
                .map_err(|e| format!("bad log level: {e}"))?,
        )
        .from_env_lossy();

    let terminal_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match file_writer(cache_root, log_file) {
        Some((writer, guard)) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(terminal_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _appender: guard })
}

fn file_writer(
    cache_root: &Path,
    log_file: Option<&PathBuf>,
) -> Option<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    let appender = match log_file {
        Some(path) => {
            let dir = path.parent()?;
            std::fs::create_dir_all(dir).ok()?;
            tracing_appender::rolling::never(dir, path.file_name()?)
        }
        None => {
            let dir = cache_root.join("logs");
            std::fs::create_dir_all(&dir).ok()?;
            tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("lemonade-server")
                .filename_suffix("log")
                .build(dir)
                .ok()?
        }
    };
    Some(tracing_appender::non_blocking(appender))
}
