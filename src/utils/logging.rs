use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::Dispatch;
use tracing::dispatcher::DefaultGuard;

use crate::utils::error::{BridgeError, Result};

/// Initialize tracing/logging for the application.
///
/// This uses a simple `with_max_level` configuration based on `default_level`.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(default_level))
        .with_target(false)
        .try_init();
}

fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Log destination owned by one table adapter.
///
/// Built from the `logger` option: `stdout`, `stderr` or `file:/path/to/log`.
/// An empty definition leaves events to the process-wide subscriber.
#[derive(Clone, Default)]
pub struct Logger {
    dispatch: Option<Dispatch>,
    file: Option<SharedFile>,
}

impl Logger {
    pub fn from_definition(definition: &str) -> Result<Self> {
        let definition = definition.trim();
        if definition.is_empty() {
            return Ok(Self::default());
        }

        let builder = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .with_ansi(false);

        match definition {
            "stdout" => Ok(Self {
                dispatch: Some(Dispatch::new(builder.with_writer(io::stdout).finish())),
                file: None,
            }),
            "stderr" => Ok(Self {
                dispatch: Some(Dispatch::new(builder.with_writer(io::stderr).finish())),
                file: None,
            }),
            other => {
                let Some(path) = other.strip_prefix("file:") else {
                    return Err(BridgeError::validation(
                        "logger",
                        format!("{other:?} is not one of stdout, stderr or file:<path>"),
                    ));
                };
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let shared = SharedFile(Arc::new(Mutex::new(file)));
                let writer = shared.clone();
                Ok(Self {
                    dispatch: Some(Dispatch::new(
                        builder.with_writer(move || writer.clone()).finish(),
                    )),
                    file: Some(shared),
                })
            }
        }
    }

    /// Routes events on the current thread to this destination until the guard
    /// is dropped. Without a destination, nothing changes.
    pub fn enter(&self) -> Option<DefaultGuard> {
        self.dispatch.as_ref().map(tracing::dispatcher::set_default)
    }

    /// Flushes a file destination to disk.
    pub fn close(&self) -> Result<()> {
        if let Some(file) = &self.file {
            let file = file.0.lock().unwrap_or_else(PoisonError::into_inner);
            file.sync_all()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("scoped", &self.dispatch.is_some())
            .field("file", &self.file.is_some())
            .finish()
    }
}

#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}
