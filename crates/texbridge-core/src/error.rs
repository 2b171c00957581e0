//! Error types for texbridge-core.

use thiserror::Error;

use crate::engine::EngineStatus;
use crate::vfs::VfsError;

/// Result type for texbridge-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an engine module.
#[derive(Debug, Error)]
pub enum Error {
    /// `load_engine` was called while a worker is still live.
    #[error("another engine instance is running; close it before loading again")]
    ConcurrentLoad,

    /// An operation needed a ready engine.
    #[error("engine is not ready (status: {status:?})")]
    NotReady { status: EngineStatus },

    /// The module hit an unrecoverable fault. The handle stays in the
    /// `Error` state until it is closed and reloaded.
    #[error("engine module aborted")]
    ModuleAbort {
        /// Transcript accumulated up to the fault.
        log: String,
    },

    /// The worker could not instantiate or initialize the module.
    #[error("failed to load engine module: {0}")]
    ModuleLoad(String),

    /// Virtual filesystem operation failed.
    #[error("virtual filesystem error: {0}")]
    Vfs(#[from] VfsError),

    /// Communication with the worker thread failed.
    #[error("worker communication error: {0}")]
    Ipc(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error leaves the handle unusable until it is reloaded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ModuleAbort { .. } | Error::ModuleLoad(_) | Error::Ipc(_)
        )
    }
}
