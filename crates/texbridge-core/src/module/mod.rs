//! The engine module contract.
//!
//! A module is an opaque compiled typesetting engine. The bridge only needs
//! a handful of native entry points, raw access to the module's memory for
//! snapshots, and a place to keep the host-side state the module calls back
//! into while it runs.
//!
//! # Architecture
//!
//! ```text
//! worker thread
//!     │
//!     └── Box<dyn EngineModule>  (created by a ModuleLoader on the worker)
//!             │
//!             ├── native entry points: setMainEntry, compileLaTeX, ...
//!             ├── linear memory: read for the snapshot, overwritten on reset
//!             │
//!             └── HostState (owned by the module, one per worker)
//!                     ├── MemFs            virtual filesystem
//!                     ├── log              transcript of the current job
//!                     └── ResourceResolver remote auxiliary file cache
//! ```

mod wasm;

use std::sync::Arc;

use crate::error::Result;
use crate::resolver::ResourceResolver;
use crate::vfs::MemFs;

pub use wasm::{WasmLoader, WasmModule};

/// Native job entry points exported by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeEntry {
    /// Run the TeX engine on the main entry.
    CompileLaTeX,
    /// Merge bibliography data after a successful run.
    CompileBibtex,
    /// Run the engine straight to PDF.
    CompilePdf,
    /// Dump a precompiled format file.
    CompileFormat,
}

impl NativeEntry {
    /// Export name of the entry point.
    pub fn export_name(self) -> &'static str {
        match self {
            NativeEntry::CompileLaTeX => "compileLaTeX",
            NativeEntry::CompileBibtex => "compileBibtex",
            NativeEntry::CompilePdf => "compilePDF",
            NativeEntry::CompileFormat => "compileFormat",
        }
    }
}

/// Host-side state a module reads and mutates through its callbacks.
///
/// One instance lives inside each worker; nothing here is shared between
/// engine handles.
pub struct HostState {
    /// Virtual filesystem the module reads sources from and writes output to.
    pub fs: MemFs,
    /// Transcript accumulated since the last reset.
    pub log: String,
    /// Remote auxiliary file cache.
    pub resolver: ResourceResolver,
}

impl HostState {
    pub fn new(resolver: ResourceResolver) -> Self {
        Self {
            fs: MemFs::new(),
            log: String::new(),
            resolver,
        }
    }

    /// Append one line to the transcript.
    pub fn append_log(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }

    /// Resolve an auxiliary file request from the module.
    pub fn resolve(&mut self, name: &str, format: i32) -> Option<String> {
        self.resolver.resolve(&mut self.fs, name, format)
    }
}

/// Something that can stop a module mid-call from another thread.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// A loaded engine module.
///
/// All methods run on the worker thread. Errors returned from the call
/// methods are module aborts: the module state is no longer trustworthy.
pub trait EngineModule: Send {
    fn host(&self) -> &HostState;

    fn host_mut(&mut self) -> &mut HostState;

    /// Push the main entry file name into the module.
    fn set_main_entry(&mut self, name: &str) -> Result<i32>;

    /// Invoke a native entry point and return its status code.
    fn call(&mut self, entry: NativeEntry) -> Result<i32>;

    /// Copy of the module's entire linear memory.
    fn memory_image(&mut self) -> Vec<u8>;

    /// Overwrite the module's memory with `image`.
    ///
    /// Bytes past the end of `image` (memory grown since the image was
    /// taken) are zeroed.
    fn restore_memory(&mut self, image: &[u8]) -> Result<()>;

    /// Handle that can abort a running call, if the module supports it.
    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

/// Creates a module on the worker thread.
pub trait ModuleLoader: Send + Sync + 'static {
    /// Instantiate and initialize the module around `host`.
    fn load(&self, host: HostState) -> Result<Box<dyn EngineModule>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal in-process module used by unit tests.

    use super::*;
    use crate::resolver::{FetchOutcome, ResourceFetcher};

    /// Fetcher that never reaches anything.
    pub struct OfflineFetcher;

    impl ResourceFetcher for OfflineFetcher {
        fn fetch(&self, url: &str) -> FetchOutcome {
            FetchOutcome::Failed(format!("offline: {}", url))
        }
    }

    pub fn offline_host() -> HostState {
        HostState::new(ResourceResolver::new(Box::new(OfflineFetcher)))
    }

    /// Module whose "memory" is a small byte array.
    ///
    /// Byte 0 counts runs since the last restore; a run that starts with a
    /// non-zero counter fails, which makes leaked state visible. A successful
    /// `compileLaTeX` copies the main entry to `<stem>.pdf` in the work root;
    /// `compileFormat` writes `xelatex.fmt`.
    pub struct CounterModule {
        pub host: HostState,
        pub memory: Vec<u8>,
        pub main_entry: String,
        pub calls: Vec<NativeEntry>,
        pub abort_on: Option<NativeEntry>,
        pub bibtex_status: i32,
    }

    impl CounterModule {
        pub fn new() -> Self {
            Self {
                host: offline_host(),
                memory: vec![0; 64],
                main_entry: String::new(),
                calls: Vec::new(),
                abort_on: None,
                bibtex_status: 0,
            }
        }
    }

    impl EngineModule for CounterModule {
        fn host(&self) -> &HostState {
            &self.host
        }

        fn host_mut(&mut self) -> &mut HostState {
            &mut self.host
        }

        fn set_main_entry(&mut self, name: &str) -> Result<i32> {
            self.main_entry = name.to_string();
            Ok(0)
        }

        fn call(&mut self, entry: NativeEntry) -> Result<i32> {
            self.calls.push(entry);
            if self.abort_on == Some(entry) {
                self.host.append_log("Engine crashed");
                return Err(crate::Error::ModuleAbort {
                    log: self.host.log.clone(),
                });
            }
            if entry == NativeEntry::CompileBibtex {
                return Ok(self.bibtex_status);
            }

            let runs = self.memory[0];
            self.memory[0] = runs.wrapping_add(1);
            if runs != 0 {
                self.host.append_log("! stale state from a previous run");
                return Ok(3);
            }
            if entry == NativeEntry::CompileFormat {
                self.host
                    .fs
                    .write_file("xelatex.fmt", "format dump")
                    .map_err(crate::Error::from)?;
                return Ok(0);
            }

            let source = match self.host.fs.read_file(&self.main_entry) {
                Ok(source) => source,
                Err(_) => {
                    self.host.append_log("! I can't find the main file");
                    return Ok(1);
                }
            };
            let stem = self.main_entry.trim_end_matches(".tex");
            self.host
                .fs
                .write_file(&format!("{}.pdf", stem), source)
                .map_err(crate::Error::from)?;
            self.host.append_log("Output written.");
            Ok(0)
        }

        fn memory_image(&mut self) -> Vec<u8> {
            self.memory.clone()
        }

        fn restore_memory(&mut self, image: &[u8]) -> Result<()> {
            self.memory[..image.len()].copy_from_slice(image);
            self.memory[image.len()..].fill(0);
            Ok(())
        }
    }
}
