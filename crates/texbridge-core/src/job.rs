//! Compile jobs.
//!
//! A job resets the execution context, runs one or two native entry points
//! against the main entry file and collects the transcript and the output
//! artifact. A zero status from the module is not enough for success: the
//! artifact must also exist.
//!
//! Only the first entry point's status counts. The bibliography pass that
//! follows a clean `compileLaTeX` exits non-zero for documents without
//! citations, so its status is logged and dropped.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::module::{EngineModule, NativeEntry};
use crate::reset::{MemorySnapshot, prepare_execution_context};
use crate::vfs::WORK_ROOT;

/// Artifact written by `compileFormat`.
pub const FORMAT_ARTIFACT: &str = "/work/xelatex.fmt";

/// Which native routine a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// `compileLaTeX`, then `compileBibtex` if the first pass succeeded.
    /// Produces the engine's configured extension.
    Latex,
    /// `compilePDF`. Always produces `.pdf`.
    Pdf,
    /// `compileFormat`. Dumps a format file to [`FORMAT_ARTIFACT`].
    Format,
}

impl JobKind {
    fn entry(self) -> NativeEntry {
        match self {
            JobKind::Latex => NativeEntry::CompileLaTeX,
            JobKind::Pdf => NativeEntry::CompilePdf,
            JobKind::Format => NativeEntry::CompileFormat,
        }
    }

    fn follow_up(self) -> Option<NativeEntry> {
        match self {
            JobKind::Latex => Some(NativeEntry::CompileBibtex),
            JobKind::Pdf | JobKind::Format => None,
        }
    }
}

/// Why a job did not produce a usable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CompileFailure {
    /// The module returned a non-zero status.
    NativeStatus { status: i32 },
    /// The module returned zero but the artifact is not there.
    MissingOutput { path: String },
}

/// Result of one compile job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    /// Status returned by the module.
    pub status: i32,
    /// Transcript produced during the job.
    pub log: String,
    /// Artifact bytes, present only on success.
    #[serde(skip)]
    pub output: Option<Vec<u8>>,
    pub failure: Option<CompileFailure>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Path of the artifact a job writes for `main_entry`.
///
/// Only the base name's stem is used, so `chapters/intro.tex` compiles to
/// `/work/intro<ext>`.
pub fn output_path(main_entry: &str, extension: &str) -> String {
    let base = main_entry.rsplit('/').next().unwrap_or(main_entry);
    let stem = match base.rfind('.') {
        Some(dot) if dot > 0 => &base[..dot],
        _ => base,
    };
    format!("{}/{}{}", WORK_ROOT, stem, extension)
}

/// Everything a job needs besides the module itself.
#[derive(Debug, Clone, Copy)]
pub struct JobSpec<'a> {
    pub kind: JobKind,
    pub main_entry: &'a str,
    /// Extension for `Latex` jobs; other kinds ignore it.
    pub extension: Option<&'a str>,
}

impl JobSpec<'_> {
    fn artifact_path(&self) -> Result<String> {
        match self.kind {
            JobKind::Pdf => Ok(output_path(self.main_entry, ".pdf")),
            JobKind::Format => Ok(FORMAT_ARTIFACT.to_string()),
            JobKind::Latex => self
                .extension
                .map(|ext| output_path(self.main_entry, ext))
                .ok_or_else(|| Error::Config("output extension has not been set".to_string())),
        }
    }
}

/// Run a job on the worker thread.
///
/// Module traps surface as `Err(Error::ModuleAbort)`; compile failures are
/// reported inside the `JobResult`.
pub fn run_job(
    module: &mut dyn EngineModule,
    snapshot: &MemorySnapshot,
    spec: JobSpec<'_>,
) -> Result<JobResult> {
    let path = spec.artifact_path()?;
    let start = Instant::now();

    prepare_execution_context(module, snapshot)?;
    module.set_main_entry(spec.main_entry)?;

    let status = module.call(spec.kind.entry())?;
    if status == 0
        && let Some(follow_up) = spec.kind.follow_up()
    {
        let follow_up_status = module.call(follow_up)?;
        tracing::debug!(
            entry = follow_up.export_name(),
            status = follow_up_status,
            "Follow-up pass finished"
        );
    }

    let log = std::mem::take(&mut module.host_mut().log);

    let (output, failure) = if status != 0 {
        (None, Some(CompileFailure::NativeStatus { status }))
    } else {
        match module.host().fs.read_file(&path) {
            Ok(bytes) => (Some(bytes), None),
            Err(e) => {
                tracing::error!("Output file {} missing after a clean run: {}", path, e);
                (None, Some(CompileFailure::MissingOutput { path }))
            }
        }
    };

    tracing::info!(
        kind = ?spec.kind,
        status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Compile job finished"
    );

    Ok(JobResult {
        status,
        log,
        output,
        failure,
    })
}
