//! wasmtime-backed engine module.
//!
//! Host imports (module `env`):
//!
//! | import           | signature                          | meaning                              |
//! |------------------|------------------------------------|--------------------------------------|
//! | `print`          | `(ptr, len)`                       | append a line to the transcript      |
//! | `print_err`      | `(ptr, len)`                       | same, also traced at WARN            |
//! | `kpse_find_file` | `(name_ptr, format) -> ptr`        | resolve a missing auxiliary file     |
//! | `fs_open`        | `(path_ptr, path_len, flags) -> fd`| open a stream, negative errno on err |
//! | `fs_read`        | `(fd, buf_ptr, len) -> n`          | read from a stream                   |
//! | `fs_write`       | `(fd, buf_ptr, len) -> n`          | write to a stream                    |
//! | `fs_close`       | `(fd) -> status`                   | close a stream                       |
//! | `abort`          | `(msg_ptr, msg_len)`               | unrecoverable fault                  |
//!
//! Required exports: `memory`, `malloc(size) -> ptr`, `setMainEntry(ptr) -> i32`.
//! Job entry points are looked up when first called.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc};

use super::{EngineModule, HostState, Interrupt, ModuleLoader, NativeEntry};
use crate::error::{Error, Result};
use crate::vfs::{OpenFlags, VfsError};

/// Line appended to the transcript when the module traps.
const CRASH_MARKER: &str = "Engine crashed";

enum ModuleSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// Loads a module from a `.wasm` (or `.wat`) file or from memory.
pub struct WasmLoader {
    source: ModuleSource,
}

impl WasmLoader {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModuleSource::File(path.into()),
        }
    }

    /// Binary or text module held in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: ModuleSource::Bytes(bytes.into()),
        }
    }
}

impl ModuleLoader for WasmLoader {
    fn load(&self, host: HostState) -> Result<Box<dyn EngineModule>> {
        let module = WasmModule::instantiate(&self.source, host)
            .map_err(|e| Error::ModuleLoad(format!("{:#}", e)))?;
        Ok(Box::new(module))
    }
}

/// A running wasm engine instance.
pub struct WasmModule {
    engine: Engine,
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    set_main_entry: TypedFunc<i32, i32>,
}

impl WasmModule {
    fn instantiate(source: &ModuleSource, host: HostState) -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;

        let module = match source {
            ModuleSource::File(path) => Module::from_file(&engine, path)
                .map_err(|e| e.context(format!("reading {}", path.display())))?,
            ModuleSource::Bytes(bytes) => Module::new(&engine, bytes)?,
        };

        let mut store = Store::new(&engine, host);
        store.epoch_deadline_trap();
        store.set_epoch_deadline(1);

        let mut linker = Linker::new(&engine);
        add_host_imports(&mut linker)?;
        let instance = linker.instantiate(&mut store, &module)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("module does not export 'memory'"))?;
        instance.get_typed_func::<i32, i32>(&mut store, "malloc")?;
        let set_main_entry = instance.get_typed_func::<i32, i32>(&mut store, "setMainEntry")?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())
                .map_err(|e| e.context("module initialization trapped"))?;
        }

        tracing::debug!(
            pages = memory.size(&store),
            "Engine module instantiated"
        );

        Ok(Self {
            engine,
            store,
            instance,
            memory,
            set_main_entry,
        })
    }

    /// Record the trap in the transcript and turn it into a module abort.
    fn abort(&mut self, err: anyhow::Error) -> Error {
        tracing::error!("Engine module trapped: {:#}", err);
        self.store.data_mut().append_log(CRASH_MARKER);
        Error::ModuleAbort {
            log: self.store.data().log.clone(),
        }
    }
}

impl EngineModule for WasmModule {
    fn host(&self) -> &HostState {
        self.store.data()
    }

    fn host_mut(&mut self) -> &mut HostState {
        self.store.data_mut()
    }

    fn set_main_entry(&mut self, name: &str) -> Result<i32> {
        let set_main_entry = self.set_main_entry.clone();
        let result = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, "malloc")
            .and_then(|malloc| {
                let ptr = write_c_string(&mut self.store, self.memory, &malloc, name)?;
                set_main_entry.call(&mut self.store, ptr)
            });
        result.map_err(|e| self.abort(e))
    }

    fn call(&mut self, entry: NativeEntry) -> Result<i32> {
        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, entry.export_name())
            .map_err(|e| {
                Error::ModuleLoad(format!(
                    "module does not export '{}': {}",
                    entry.export_name(),
                    e
                ))
            })?;
        func.call(&mut self.store, ()).map_err(|e| self.abort(e))
    }

    fn memory_image(&mut self) -> Vec<u8> {
        self.memory.data(&self.store).to_vec()
    }

    fn restore_memory(&mut self, image: &[u8]) -> Result<()> {
        let data = self.memory.data_mut(&mut self.store);
        if data.len() < image.len() {
            return Err(Error::ModuleAbort {
                log: format!(
                    "memory is {} bytes, smaller than the {} byte snapshot",
                    data.len(),
                    image.len()
                ),
            });
        }
        let (prefix, tail) = data.split_at_mut(image.len());
        prefix.copy_from_slice(image);
        tail.fill(0);
        Ok(())
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(EpochInterrupt(self.engine.clone())))
    }
}

/// Bumps the engine epoch so the running call traps at its next check.
struct EpochInterrupt(Engine);

impl Interrupt for EpochInterrupt {
    fn interrupt(&self) {
        self.0.increment_epoch();
    }
}

fn add_host_imports(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "print",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let line = read_string(&mut caller, ptr, len)?;
            caller.data_mut().append_log(&line);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "print_err",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let line = read_string(&mut caller, ptr, len)?;
            tracing::warn!("{}", line);
            caller.data_mut().append_log(&line);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "kpse_find_file",
        |mut caller: Caller<'_, HostState>, name_ptr: i32, format: i32| -> anyhow::Result<i32> {
            let name = read_c_string(&mut caller, name_ptr)?;
            let Some(path) = caller.data_mut().resolve(&name, format) else {
                return Ok(0);
            };
            let malloc = caller
                .get_export("malloc")
                .and_then(Extern::into_func)
                .ok_or_else(|| anyhow!("module does not export 'malloc'"))?
                .typed::<i32, i32>(&caller)?;
            let memory = exported_memory(&mut caller)?;
            write_c_string(&mut caller, memory, &malloc, &path)
        },
    )?;

    linker.func_wrap(
        "env",
        "fs_open",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, flags: i32| -> anyhow::Result<i32> {
            let path = read_string(&mut caller, ptr, len)?;
            match caller.data_mut().fs.open(&path, OpenFlags::from_bits(flags)) {
                Ok(fd) => Ok(fd as i32),
                Err(e) => {
                    tracing::trace!("fs_open {} failed: {}", path, e);
                    Ok(e.code())
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "fs_read",
        |mut caller: Caller<'_, HostState>, fd: i32, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let memory = exported_memory(&mut caller)?;
            let (data, host) = memory.data_and_store_mut(&mut caller);
            let range = span(ptr, len, data.len())?;
            let result = descriptor(fd).and_then(|fd| host.fs.read(fd, &mut data[range]));
            Ok(status_of(result))
        },
    )?;

    linker.func_wrap(
        "env",
        "fs_write",
        |mut caller: Caller<'_, HostState>, fd: i32, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let memory = exported_memory(&mut caller)?;
            let (data, host) = memory.data_and_store_mut(&mut caller);
            let range = span(ptr, len, data.len())?;
            let result = descriptor(fd).and_then(|fd| host.fs.write(fd, &data[range]));
            Ok(status_of(result))
        },
    )?;

    linker.func_wrap(
        "env",
        "fs_close",
        |mut caller: Caller<'_, HostState>, fd: i32| -> i32 {
            match descriptor(fd).and_then(|fd| caller.data_mut().fs.close(fd)) {
                Ok(()) => 0,
                Err(e) => e.code(),
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "abort",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let message = read_string(&mut caller, ptr, len)
                .unwrap_or_else(|_| "<unreadable message>".to_string());
            caller.data_mut().append_log(&message);
            bail!("module aborted: {}", message)
        },
    )?;

    Ok(())
}

fn descriptor(fd: i32) -> std::result::Result<u32, VfsError> {
    u32::try_from(fd).map_err(|_| VfsError::BadDescriptor(u32::MAX))
}

fn status_of(result: std::result::Result<usize, VfsError>) -> i32 {
    match result {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(e) => e.code(),
    }
}

fn exported_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("module does not export 'memory'"))
}

/// Bounds-checked byte range for a guest pointer and length.
fn span(ptr: i32, len: i32, size: usize) -> anyhow::Result<Range<usize>> {
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .filter(|&end| end <= size)
        .ok_or_else(|| anyhow!("guest buffer {:#x}+{} is out of bounds", ptr, len))?;
    Ok(start..end)
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let memory = exported_memory(caller)?;
    let data = memory.data(&*caller);
    let range = span(ptr, len, data.len())?;
    Ok(String::from_utf8_lossy(&data[range]).into_owned())
}

fn read_c_string(caller: &mut Caller<'_, HostState>, ptr: i32) -> anyhow::Result<String> {
    let memory = exported_memory(caller)?;
    let data = memory.data(&*caller);
    let start = ptr as u32 as usize;
    let tail = data
        .get(start..)
        .ok_or_else(|| anyhow!("string pointer {:#x} is out of bounds", ptr))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow!("unterminated string at {:#x}", ptr))?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

/// Copy `text` plus a NUL terminator into guest memory obtained from `malloc`.
fn write_c_string(
    mut store: impl wasmtime::AsContextMut<Data = HostState>,
    memory: Memory,
    malloc: &TypedFunc<i32, i32>,
    text: &str,
) -> anyhow::Result<i32> {
    let size = i32::try_from(text.len() + 1)?;
    let ptr = malloc.call(&mut store, size)?;
    if ptr == 0 {
        bail!("malloc({}) returned null", size);
    }
    let data = memory.data_mut(&mut store);
    let range = span(ptr, size, data.len())?;
    let (body, nul) = data[range].split_at_mut(text.len());
    body.copy_from_slice(text.as_bytes());
    nul[0] = 0;
    Ok(ptr)
}
