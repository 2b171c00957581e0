//! Engine lifecycle controller.
//!
//! A [`TexEngine`] owns at most one worker at a time and drives its status:
//!
//! ```text
//! Init ──ready──▶ Ready ──job start──▶ Busy ──job end──▶ Ready
//!   │               │                    │
//!   └───────────────┴──── module abort ──┴──▶ Error
//! ```
//!
//! `Error` is terminal for the loaded module; the only way out is
//! [`TexEngine::close_worker`] followed by [`TexEngine::load_engine`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ipc::{WorkerClient, WorkerCommand, WorkerHandle, WorkerResponse};
use crate::job::{JobKind, JobResult};
use crate::module::{ModuleLoader, WasmLoader};

/// Lifecycle status of an engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Loading, or not loaded.
    Init,
    /// Accepting jobs and filesystem mutations.
    Ready,
    /// A job is running.
    Busy,
    /// The module aborted. Close and reload to recover.
    Error,
}

struct Inner {
    status: EngineStatus,
    worker: Option<WorkerHandle>,
}

/// Host-side handle for one engine module.
///
/// All methods take `&self`; share the engine across tasks with an `Arc`.
/// Jobs are driven on the ambient tokio runtime.
/// Independent `TexEngine` values share nothing and run in parallel.
pub struct TexEngine {
    config: EngineConfig,
    loader: Arc<dyn ModuleLoader>,
    inner: Arc<Mutex<Inner>>,
}

impl TexEngine {
    /// Engine that loads the module binary named in `config`.
    pub fn new(config: EngineConfig) -> Self {
        let loader = WasmLoader::from_file(config.module_path.clone());
        Self::with_loader(config, loader)
    }

    /// Engine with a custom module loader.
    pub fn with_loader(config: EngineConfig, loader: impl ModuleLoader) -> Self {
        Self {
            config,
            loader: Arc::new(loader),
            inner: Arc::new(Mutex::new(Inner {
                status: EngineStatus::Init,
                worker: None,
            })),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    /// Start a worker, wait for the module to initialize and push the
    /// configured extension and endpoint into it.
    ///
    /// Fails with [`Error::ConcurrentLoad`] while a worker is live.
    pub async fn load_engine(&self) -> Result<()> {
        let (id, ready) = {
            let mut inner = self.lock();
            if inner.worker.is_some() {
                return Err(Error::ConcurrentLoad);
            }
            inner.status = EngineStatus::Init;
            let (worker, ready) = WorkerHandle::spawn(self.loader.clone(), &self.config)?;
            let id = worker.id();
            inner.worker = Some(worker);
            (id, ready)
        };

        let start = Instant::now();
        let signal = ready
            .await
            .unwrap_or_else(|_| Err(Error::Ipc("Worker exited during startup".to_string())));
        let ready = match signal {
            Ok(ready) => ready,
            Err(e) => {
                tracing::error!("Failed to load {} engine: {}", self.config.variant, e);
                self.set_status_for(id, EngineStatus::Error);
                return Err(e);
            }
        };

        let client = {
            let inner = self.lock();
            match inner.worker.as_ref() {
                Some(worker) if worker.id() == id => {
                    worker.arm(ready);
                    worker.client()
                }
                _ => return Err(Error::Ipc("Worker was closed during startup".to_string())),
            }
        };

        let pushed = async {
            client
                .call(WorkerCommand::SetExtension {
                    extension: self.config.extension.clone(),
                })
                .await?;
            client
                .call(WorkerCommand::SetEndpoint {
                    url: self.config.endpoint.clone(),
                })
                .await?;
            if self.config.main_entry != crate::config::DEFAULT_MAIN_ENTRY {
                client
                    .call(WorkerCommand::SetMainEntry {
                        name: self.config.main_entry.clone(),
                    })
                    .await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = pushed {
            self.set_status_for(id, EngineStatus::Error);
            return Err(e);
        }

        self.set_status_for(id, EngineStatus::Ready);
        tracing::info!(
            variant = %self.config.variant,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Engine loaded"
        );
        Ok(())
    }

    /// Run `compileLaTeX` (plus the bibliography pass) on the main entry.
    pub async fn compile_latex(&self) -> Result<JobResult> {
        self.compile(JobKind::Latex).await
    }

    /// Run `compilePDF` on the main entry.
    pub async fn compile_pdf(&self) -> Result<JobResult> {
        self.compile(JobKind::Pdf).await
    }

    /// Run `compileFormat` and return the dumped `xelatex.fmt`.
    pub async fn compile_format(&self) -> Result<JobResult> {
        self.compile(JobKind::Format).await
    }

    /// Select the main entry file for subsequent jobs.
    pub async fn set_main_file(&self, name: &str) -> Result<()> {
        self.mutate(WorkerCommand::SetMainEntry {
            name: name.to_string(),
        })
        .await
    }

    /// Write a file below the work root.
    pub async fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> Result<()> {
        self.mutate(WorkerCommand::WriteFile {
            path: path.to_string(),
            contents: contents.into(),
        })
        .await
    }

    /// Create a directory below the work root. `""` and `"/"` are no-ops.
    pub async fn make_dir(&self, path: &str) -> Result<()> {
        self.ready_client()?;
        if path.is_empty() || path == "/" {
            return Ok(());
        }
        self.mutate(WorkerCommand::MakeDir {
            path: path.to_string(),
        })
        .await
    }

    /// Empty the work root. Fetched resources stay cached.
    pub async fn flush_cache(&self) -> Result<()> {
        self.mutate(WorkerCommand::FlushWorkArea).await
    }

    /// Point resource resolution at `url`.
    ///
    /// Works in any status; without a live worker it does nothing.
    pub async fn set_endpoint(&self, url: &str) -> Result<()> {
        let client = self.lock().worker.as_ref().map(WorkerHandle::client);
        match client {
            Some(client) => {
                client
                    .call(WorkerCommand::SetEndpoint {
                        url: url.to_string(),
                    })
                    .await
            }
            None => Ok(()),
        }
    }

    /// Tear down the worker. Idempotent.
    ///
    /// A job in flight is interrupted and its caller gets an error. The
    /// status drops back to `Init`.
    pub fn close_worker(&self) {
        let worker = {
            let mut inner = self.lock();
            inner.status = EngineStatus::Init;
            inner.worker.take()
        };
        if let Some(mut worker) = worker {
            worker.kill();
            tracing::info!(variant = %self.config.variant, "Engine closed");
        }
    }

    async fn compile(&self, kind: JobKind) -> Result<JobResult> {
        let (id, client) = {
            let mut inner = self.lock();
            let (id, client) = Self::ready_worker(&inner)?;
            inner.status = EngineStatus::Busy;
            (id, client)
        };

        tracing::info!(?kind, "Engine compilation start");
        // The request runs as its own task so the status leaves Busy when the
        // worker finishes, even if the caller stops waiting.
        let inner = self.inner.clone();
        let job = tokio::spawn(async move {
            let result = match client.request(WorkerCommand::Compile(kind)).await {
                Ok(WorkerResponse::Compiled(result)) => Ok(result),
                Ok(WorkerResponse::Error(e)) => Err(e),
                Ok(other) => Err(Error::Ipc(format!(
                    "Unexpected response to compile: {:?}",
                    other
                ))),
                Err(e) => Err(e),
            };

            let next = match &result {
                Err(e) if e.is_fatal() => EngineStatus::Error,
                _ => EngineStatus::Ready,
            };
            set_status_for(&inner, id, next);
            tracing::info!(?kind, status = ?next, "Engine compilation finish");
            result
        });

        job.await
            .unwrap_or_else(|e| Err(Error::Ipc(format!("Compile task failed: {}", e))))
    }

    async fn mutate(&self, command: WorkerCommand) -> Result<()> {
        let client = self.ready_client()?;
        client.call(command).await
    }

    fn ready_client(&self) -> Result<WorkerClient> {
        Self::ready_worker(&self.lock()).map(|(_, client)| client)
    }

    fn ready_worker(inner: &Inner) -> Result<(Uuid, WorkerClient)> {
        match (&inner.worker, inner.status) {
            (Some(worker), EngineStatus::Ready) => Ok((worker.id(), worker.client())),
            (_, status) => Err(Error::NotReady { status }),
        }
    }

    fn set_status_for(&self, id: Uuid, status: EngineStatus) {
        set_status_for(&self.inner, id, status);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

/// Update the status only if `id` is still the live worker.
fn set_status_for(inner: &Mutex<Inner>, id: Uuid, status: EngineStatus) {
    let mut inner = lock(inner);
    if inner.worker.as_ref().is_some_and(|w| w.id() == id) {
        inner.status = status;
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl Drop for TexEngine {
    fn drop(&mut self) {
        self.close_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineVariant;
    use crate::module::test_support::CounterModule;
    use crate::module::{EngineModule, HostState, NativeEntry};

    struct CounterLoader {
        abort_on: Option<NativeEntry>,
    }

    impl ModuleLoader for CounterLoader {
        fn load(&self, host: HostState) -> Result<Box<dyn EngineModule>> {
            let mut module = CounterModule::new();
            module.host = host;
            module.abort_on = self.abort_on;
            Ok(Box::new(module))
        }
    }

    fn engine(abort_on: Option<NativeEntry>) -> TexEngine {
        let config = EngineConfig::for_variant(EngineVariant::PdfTeX, ".");
        TexEngine::with_loader(config, CounterLoader { abort_on })
    }

    #[tokio::test]
    async fn test_load_then_compile() {
        let engine = engine(None);
        assert_eq!(engine.status(), EngineStatus::Init);

        engine.load_engine().await.unwrap();
        assert!(engine.is_ready());

        engine.write_file("main.tex", "doc").await.unwrap();
        let result = engine.compile_latex().await.unwrap();
        assert!(result.is_success());
        assert_eq!(engine.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_second_load_is_rejected() {
        let engine = engine(None);
        engine.load_engine().await.unwrap();
        assert!(matches!(engine.load_engine().await, Err(Error::ConcurrentLoad)));
        assert!(engine.is_ready());
    }

    #[tokio::test]
    async fn test_calls_before_load_are_rejected() {
        let engine = engine(None);
        assert!(matches!(
            engine.compile_latex().await,
            Err(Error::NotReady {
                status: EngineStatus::Init
            })
        ));
        assert!(matches!(
            engine.write_file("main.tex", "x").await,
            Err(Error::NotReady { .. })
        ));
        assert!(matches!(engine.make_dir("").await, Err(Error::NotReady { .. })));
        // Endpoint configuration does not need a worker.
        engine.set_endpoint("http://localhost/").await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_moves_to_error() {
        let engine = engine(Some(NativeEntry::CompileLaTeX));
        engine.load_engine().await.unwrap();

        let result = engine.compile_latex().await;
        assert!(matches!(result, Err(Error::ModuleAbort { .. })));
        assert_eq!(engine.status(), EngineStatus::Error);
        assert!(matches!(
            engine.compile_latex().await,
            Err(Error::NotReady {
                status: EngineStatus::Error
            })
        ));

        engine.close_worker();
        engine.load_engine().await.unwrap();
        assert!(engine.is_ready());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = engine(None);
        engine.close_worker();
        engine.load_engine().await.unwrap();
        engine.close_worker();
        engine.close_worker();
        assert!(!engine.is_ready());
        engine.load_engine().await.unwrap();
        assert!(engine.is_ready());
    }
}
