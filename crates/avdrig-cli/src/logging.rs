//! Tracing subscriber setup.
//!
//! Logs always go to stderr, filtered by `RUST_LOG` (default `info`) so the
//! test command keeps sole use of stdout. With `--log-file` the same events
//! are also written, without ANSI colors, to that file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keep alive until exit so buffered file lines are flushed.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init(log_file: Option<&Path>) -> std::io::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(LogGuard { _file_guard: None });
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("log file path {} has no file name", path.display()),
        )
    })?;
    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(LogGuard {
        _file_guard: Some(guard),
    })
}
