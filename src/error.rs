use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the station core.
///
/// Command failures are scoped to a single device; monitor and enumeration
/// failures stop the control loop.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job queue is full, dropping job for {0}")]
    QueueFull(String),

    #[error("job queue is closed")]
    QueueClosed,

    #[error("device event source failed: {0}")]
    Monitor(String),

    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl FlashError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = FlashError> = std::result::Result<T, E>;
