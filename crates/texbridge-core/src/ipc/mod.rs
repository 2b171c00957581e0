//! Host/worker communication for engine modules.
//!
//! Every engine handle talks to its module through one worker thread; this
//! module provides the message types and the handle that owns the thread.

pub mod protocol;
mod worker;

pub use protocol::{WorkerCommand, WorkerResponse};
pub use worker::{WorkerHandle, WorkerKillHandle};

pub(crate) use worker::WorkerClient;
