//! Error taxonomy for the detection engine.
//!
//! Configuration problems (bad paths, missing baseline, unknown plugin keys)
//! surface synchronously from constructors and `start()`, before any
//! background work begins. Faults inside a running task never propagate back
//! to the caller; they terminate the task as `Failed` and are reported
//! through the alert callback's status log.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A second `start()` while a task is running is rejected, never queued.
    #[error("a task is already running on this instance")]
    AlreadyRunning,

    /// `save()` was called before a training task reached the Completed state.
    #[error("baseline has not been derived; run start() to completion before save()")]
    NotTrained,

    /// The requested model plugin key is not present in the registry.
    #[error("unknown model plugin '{0}'")]
    UnknownPlugin(String),

    /// A single source item could not be decoded. Non-fatal: the ingestor
    /// skips the item and logs a warning.
    #[error("failed to decode {path}: {reason}")]
    ItemDecode { path: PathBuf, reason: String },

    /// Unexpected fault inside a task body. Terminates the task as Failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("baseline archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
