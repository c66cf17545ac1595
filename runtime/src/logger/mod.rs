//! Logging backend.
//!
//! All runtime code logs through the `log` facade; this module supplies an
//! optional asynchronous file backend so a host binary can install one
//! without pulling in anything else.

pub mod async_logger;

pub use async_logger::AsyncLogger;

use std::path::Path;
use std::sync::Arc;

use log::{LevelFilter, Log};

/// Install an [`AsyncLogger`] writing to `path` as the process logger.
///
/// Fails if the file cannot be created or another logger is already
/// installed.
pub fn init(path: &Path, level: LevelFilter) -> Result<(), String> {
    let logger = AsyncLogger::start(path, level).map_err(|err| err.to_string())?;
    log::set_boxed_logger(Box::new(LoggerHandle(logger))).map_err(|err| err.to_string())?;
    log::set_max_level(level);
    Ok(())
}

/// Adapter so the installed boxed logger shares the flusher-owning
/// instance.
struct LoggerHandle(Arc<AsyncLogger>);

impl log::Log for LoggerHandle {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        self.0.log(record);
    }

    fn flush(&self) {
        self.0.flush();
    }
}
