//! Messages exchanged between an engine handle and its worker thread.
//!
//! Commands travel over a standard channel; each one carries a one-shot
//! reply slot the host awaits. Messages never leave the process, so they
//! are plain Rust values.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::Error;
use crate::job::{JobKind, JobResult};
use crate::module::Interrupt;

/// Command sent from the host to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Run a compile job.
    Compile(JobKind),

    /// Write a file into the virtual filesystem.
    WriteFile {
        /// Path below the work root.
        path: String,
        contents: Vec<u8>,
    },

    /// Create a directory.
    MakeDir { path: String },

    /// Select the main entry file for later jobs.
    SetMainEntry { name: String },

    /// Set the output extension for `Compile(JobKind::Latex)`.
    SetExtension { extension: String },

    /// Point the resource resolver at a new endpoint.
    SetEndpoint { url: String },

    /// Empty the work root. The resource cache is kept.
    FlushWorkArea,

    /// Check the worker is alive.
    Ping,

    /// Stop the worker loop.
    Shutdown,
}

/// Response sent from the worker back to the host.
#[derive(Debug)]
pub enum WorkerResponse {
    /// The command completed without a payload.
    Done,

    /// A compile job finished.
    Compiled(JobResult),

    /// The command failed.
    Error(Error),

    /// Response to `Ping`.
    Pong,
}

/// A command and the slot its response goes to.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub command: WorkerCommand,
    pub reply: Option<oneshot::Sender<WorkerResponse>>,
}

/// Sent once by the worker when the module finished initializing.
pub(crate) struct Ready {
    /// Stops a module call in progress, if the module supports it.
    pub interrupt: Option<Arc<dyn Interrupt>>,
}

impl std::fmt::Debug for Ready {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ready")
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}
