//! Sandboxed bridge to WebAssembly builds of TeX engines.
//!
//! This crate provides:
//! - Engine lifecycle control with one isolated worker per handle
//! - Per-job execution context reset from a post-init memory snapshot
//! - Remote resolution of auxiliary files with positive and negative caching
//! - An in-memory virtual filesystem exposed to the engine module

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod job;
pub mod module;
pub mod reset;
pub mod resolver;
pub mod vfs;

pub use config::{EngineConfig, EngineVariant};
pub use engine::{EngineStatus, TexEngine};
pub use error::{Error, Result};
pub use job::{CompileFailure, JobKind, JobResult};
pub use module::{EngineModule, HostState, ModuleLoader, NativeEntry, WasmLoader};
pub use reset::MemorySnapshot;
pub use resolver::{FetchOutcome, HttpFetcher, ResourceFetcher, ResourceResolver};
pub use vfs::{MemFs, VfsError};
