//! Console and rolling file logging

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{Result, RoomError};

/// Log files are named `np-room-manager.<date>.log`
pub const LOG_FILE_PREFIX: &str = "np-room-manager";

/// Rotated files kept before the oldest is deleted
pub const MAX_LOG_FILES: usize = 10;

/// Daily rotated log file appender in `dir`
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(|e| RoomError::config(format!("log directory {}: {}", dir.display(), e)))
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `log_level`. With `log_dir` set, output also goes to
/// a rolling file through a background writer; keep the returned guard alive
/// until exit so it is flushed.
pub fn init(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| RoomError::config(format!("invalid log filter {:?}: {}", log_level, e)))?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(dir)?);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}
