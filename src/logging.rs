use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{GatewayConfig, LogFormat};
use crate::error::{ConfigError, Result};

/// Installs the global subscriber.
///
/// Logs go to stderr unless `log_file` is set, since stdout carries the
/// protocol. `RUST_LOG` overrides the configured level. Keep the returned
/// guard alive for as long as file logging should flush.
pub fn init(config: &GatewayConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level_directive(&config.log_level, debug))
            .map_err(|e| ConfigError::Validation(format!("invalid log level: {e}")))?,
    };

    let (writer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            (writer, Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);
    let layer = match config.log_format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.with_ansi(guard.is_none()).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| ConfigError::Validation(format!("logging already initialized: {e}")))?;
    Ok(guard)
}

fn level_directive(level: &str, debug: bool) -> String {
    if debug {
        "debug".to_string()
    } else if level.trim().is_empty() {
        "info".to_string()
    } else {
        level.trim().to_string()
    }
}

fn file_writer(path: &Path) -> Result<(BoxMakeWriter, WorkerGuard)> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let file_name = path.file_name().ok_or_else(|| {
        ConfigError::Validation(format!("log_file {} has no file name", path.display()))
    })?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((BoxMakeWriter::new(writer), guard))
}
