//! Worker thread management.
//!
//! Each engine handle owns one worker thread. The thread creates the module,
//! takes the memory snapshot, signals readiness and then serves commands one
//! at a time until it is told to stop or the host drops its end of the
//! channel. Nothing the thread owns is shared with any other worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::job::{JobKind, JobSpec, run_job};
use crate::module::{EngineModule, HostState, Interrupt, ModuleLoader};
use crate::reset::MemorySnapshot;
use crate::resolver::{HttpFetcher, ResourceResolver};
use crate::vfs::WORK_ROOT;

use super::protocol::{Envelope, Ready, WorkerCommand, WorkerResponse};

/// Receives the worker's readiness signal.
pub(crate) type ReadySignal = oneshot::Receiver<Result<Ready>>;

/// Host-side handle to a worker thread.
pub struct WorkerHandle {
    id: Uuid,
    commands: mpsc::Sender<Envelope>,
    kill: WorkerKillHandle,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start a worker thread that loads a module with `loader`.
    ///
    /// The returned signal resolves once the module is initialized, or with
    /// the error that stopped it.
    pub(crate) fn spawn(
        loader: Arc<dyn ModuleLoader>,
        config: &EngineConfig,
    ) -> Result<(Self, ReadySignal)> {
        let id = Uuid::new_v4();
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let fetch_timeout = config.fetch_timeout;

        let thread = std::thread::Builder::new()
            .name(format!("texbridge-{}", config.variant))
            .spawn(move || worker_main(loader.as_ref(), fetch_timeout, inbox, ready_tx))
            .map_err(|e| Error::Ipc(format!("Failed to spawn worker thread: {}", e)))?;

        tracing::debug!(worker = %id, "Spawned engine worker");

        let handle = Self {
            id,
            commands,
            kill: WorkerKillHandle::new(),
            thread: Some(thread),
        };
        Ok((handle, ready_rx))
    }

    /// Identity of this worker, unique per spawn.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// A cloneable sender for issuing commands without holding the handle.
    pub(crate) fn client(&self) -> WorkerClient {
        WorkerClient {
            commands: self.commands.clone(),
        }
    }

    /// Install the interrupt the worker handed over with its ready signal.
    pub(crate) fn arm(&self, ready: Ready) {
        self.kill.arm(ready.interrupt);
    }

    pub fn kill_handle(&self) -> WorkerKillHandle {
        self.kill.clone()
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker.
    ///
    /// A module call in progress is interrupted and its caller receives the
    /// resulting error. The thread is detached rather than joined, so this
    /// never blocks on a stuck fetch.
    pub fn kill(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.kill.kill();
        let _ = self.commands.send(Envelope {
            command: WorkerCommand::Shutdown,
            reply: None,
        });
        self.thread = None;
        tracing::debug!(worker = %self.id, "Engine worker stopped");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Sends commands to a worker and awaits the replies.
#[derive(Clone)]
pub(crate) struct WorkerClient {
    commands: mpsc::Sender<Envelope>,
}

impl WorkerClient {
    pub async fn request(&self, command: WorkerCommand) -> Result<WorkerResponse> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Envelope {
                command,
                reply: Some(reply),
            })
            .map_err(|_| Error::Ipc("Worker has exited".to_string()))?;
        response
            .await
            .map_err(|_| Error::Ipc("Worker exited before replying".to_string()))
    }

    /// Send a command that has no payload in its reply.
    pub async fn call(&self, command: WorkerCommand) -> Result<()> {
        match self.request(command).await? {
            WorkerResponse::Done => Ok(()),
            WorkerResponse::Error(e) => Err(e),
            other => Err(Error::Ipc(format!("Unexpected response from worker: {:?}", other))),
        }
    }
}

/// Thread-safe handle for stopping a worker's module from another thread.
#[derive(Clone, Default)]
pub struct WorkerKillHandle {
    killed: Arc<AtomicBool>,
    interrupt: Arc<Mutex<Option<Arc<dyn Interrupt>>>>,
}

impl WorkerKillHandle {
    fn new() -> Self {
        Self::default()
    }

    fn arm(&self, interrupt: Option<Arc<dyn Interrupt>>) {
        let mut slot = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
        *slot = interrupt;
        if self.is_killed()
            && let Some(interrupt) = slot.as_ref()
        {
            interrupt.interrupt();
        }
    }

    /// Interrupt the module. Only the first call has an effect.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slot = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(interrupt) = slot.as_ref() {
            interrupt.interrupt();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// State owned by the worker thread.
struct WorkerState {
    module: Box<dyn EngineModule>,
    snapshot: MemorySnapshot,
    main_entry: String,
    extension: Option<String>,
}

impl WorkerState {
    fn boot(loader: &dyn ModuleLoader, fetch_timeout: Duration) -> Result<Self> {
        let fetcher = HttpFetcher::new(fetch_timeout)?;
        let host = HostState::new(ResourceResolver::new(Box::new(fetcher)));
        let mut module = loader.load(host)?;
        let snapshot = MemorySnapshot::capture(module.as_mut());
        Ok(Self {
            module,
            snapshot,
            main_entry: crate::config::DEFAULT_MAIN_ENTRY.to_string(),
            extension: None,
        })
    }

    fn handle(&mut self, command: WorkerCommand) -> WorkerResponse {
        let result = match command {
            WorkerCommand::Compile(kind) => return self.compile(kind),
            WorkerCommand::Ping => return WorkerResponse::Pong,
            WorkerCommand::WriteFile { path, contents } => self
                .module
                .host_mut()
                .fs
                .write_file(&work_path(&path), contents)
                .map_err(Error::from),
            WorkerCommand::MakeDir { path } => self
                .module
                .host_mut()
                .fs
                .mkdir(&work_path(&path))
                .map_err(Error::from),
            WorkerCommand::SetMainEntry { name } => {
                self.main_entry = name;
                Ok(())
            }
            WorkerCommand::SetExtension { extension } => {
                self.extension = Some(extension);
                Ok(())
            }
            WorkerCommand::SetEndpoint { url } => {
                self.module.host_mut().resolver.set_endpoint(url);
                Ok(())
            }
            WorkerCommand::FlushWorkArea => {
                self.module.host_mut().fs.clean_dir(WORK_ROOT);
                Ok(())
            }
            WorkerCommand::Shutdown => Ok(()),
        };

        match result {
            Ok(()) => WorkerResponse::Done,
            Err(e) => WorkerResponse::Error(e),
        }
    }

    fn compile(&mut self, kind: JobKind) -> WorkerResponse {
        let spec = JobSpec {
            kind,
            main_entry: &self.main_entry,
            extension: self.extension.as_deref(),
        };
        match run_job(self.module.as_mut(), &self.snapshot, spec) {
            Ok(result) => WorkerResponse::Compiled(result),
            Err(e) => WorkerResponse::Error(e),
        }
    }
}

/// Host paths are always relative to the work root.
fn work_path(path: &str) -> String {
    format!("{}/{}", WORK_ROOT, path.trim_start_matches('/'))
}

fn worker_main(
    loader: &dyn ModuleLoader,
    fetch_timeout: Duration,
    inbox: mpsc::Receiver<Envelope>,
    ready: oneshot::Sender<Result<Ready>>,
) {
    let mut state = match WorkerState::boot(loader, fetch_timeout) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Engine worker failed to start: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let interrupt = state.module.interrupt_handle();
    if ready.send(Ok(Ready { interrupt })).is_err() {
        tracing::debug!("Host stopped waiting for the worker; exiting");
        return;
    }

    while let Ok(Envelope { command, reply }) = inbox.recv() {
        if command == WorkerCommand::Shutdown {
            break;
        }
        let response = state.handle(command);
        if let Some(reply) = reply {
            let _ = reply.send(response);
        }
    }

    tracing::debug!("Engine worker exiting");
}
