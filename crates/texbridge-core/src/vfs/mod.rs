//! Virtual filesystem exposed to the engine module.
//!
//! The module sees a flat in-memory tree with two fixed roots:
//!
//! ```text
//! /
//! ├── tex/    # Remotely fetched auxiliary files (lives as long as the worker)
//! └── work/   # Host-supplied project sources and generated output
//! ```
//!
//! Restoring the module's memory before a job does not touch this tree;
//! files written by one job stay visible to the next until the host flushes
//! the work root.

mod memfs;

pub use memfs::{Fd, FileKind, FileStat, MemFs, OpenFlags};

use thiserror::Error;

/// Root of the resource cache populated by remote resolution.
pub const TEX_CACHE_ROOT: &str = "/tex";

/// Root holding the project sources and job output.
pub const WORK_ROOT: &str = "/work";

/// Errors raised by virtual filesystem operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("bad file descriptor: {0}")]
    BadDescriptor(Fd),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),
}

impl VfsError {
    /// Negative errno-style code handed back to the module through the host ABI.
    pub fn code(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => -2,
            VfsError::BadDescriptor(_) => -9,
            VfsError::AlreadyExists(_) => -17,
            VfsError::NotADirectory(_) => -20,
            VfsError::IsADirectory(_) => -21,
            VfsError::InvalidPath(_) => -22,
            VfsError::NotEmpty(_) => -39,
        }
    }
}
