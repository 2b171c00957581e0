//! Execution context reset between jobs.
//!
//! The engine keeps global state (macro tables, loaded fonts, half-written
//! output) in its linear memory. A copy of that memory taken right after
//! initialization is written back before every job, so each job starts from
//! the same post-init state regardless of what ran before it.
//!
//! The virtual filesystem is not part of the snapshot. Files written by one
//! job are still there for the next one.

use crate::error::Result;
use crate::module::EngineModule;
use crate::vfs::{MemFs, WORK_ROOT};

/// Immutable copy of a module's memory after initialization.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    image: Box<[u8]>,
}

impl MemorySnapshot {
    /// Take the snapshot. Call once, after the module finished initializing
    /// and before anything else touches it.
    pub fn capture(module: &mut dyn EngineModule) -> Self {
        let image = module.memory_image().into_boxed_slice();
        tracing::debug!(bytes = image.len(), "Captured memory snapshot");
        Self { image }
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.image
    }
}

/// Return the module to its post-init state before a job.
///
/// Clears the transcript, writes the snapshot back, closes every stream the
/// previous job left open and moves the working directory to the work root.
pub fn prepare_execution_context(
    module: &mut dyn EngineModule,
    snapshot: &MemorySnapshot,
) -> Result<()> {
    module.host_mut().log.clear();
    module.restore_memory(snapshot.as_bytes())?;

    let host = module.host_mut();
    let closed = close_streams(&mut host.fs);
    if closed > 0 {
        tracing::debug!("Closed {} stream(s) left open by the previous job", closed);
    }
    host.fs.chdir(WORK_ROOT)?;
    Ok(())
}

fn close_streams(fs: &mut MemFs) -> usize {
    let open = fs.open_streams();
    for fd in &open {
        if let Err(e) = fs.close(*fd) {
            tracing::warn!("Failed to close stream {}: {}", fd, e);
        }
    }
    open.len()
}
