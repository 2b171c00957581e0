//! Compile command implementation for texbridge CLI.
//!
//! Loads an engine, uploads the project directory into the work root, runs
//! one job and writes the artifact back to disk.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use texbridge_core::{CompileFailure, EngineConfig, EngineVariant, JobResult, TexEngine};
use walkdir::WalkDir;

use crate::colors;

/// Exit code when the engine reported success but left no artifact.
const EXIT_MISSING_OUTPUT: i32 = 1;

/// Options for `texbridge compile`.
pub struct CompileOptions {
    pub project: PathBuf,
    pub engine: String,
    pub module: Option<PathBuf>,
    pub main: Option<String>,
    pub endpoint: Option<String>,
    pub pdf: bool,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// Run the command, returning the process exit code.
pub async fn execute(options: CompileOptions) -> anyhow::Result<i32> {
    let start = Instant::now();

    if !options.project.is_dir() {
        anyhow::bail!("project directory not found: {}", options.project.display());
    }
    let config = build_config(&options)?;
    let main_entry = config.main_entry.clone();
    let extension = if options.pdf {
        ".pdf".to_string()
    } else {
        config.extension.clone()
    };

    let engine = TexEngine::new(config);
    engine.load_engine().await.with_context(|| {
        format!(
            "failed to start the {} engine from {}",
            engine.config().variant,
            engine.config().module_path.display()
        )
    })?;

    let uploaded = upload_project(&engine, &options.project).await?;
    tracing::debug!("Uploaded {} file(s) from {}", uploaded, options.project.display());

    let result = if options.pdf {
        engine.compile_pdf().await
    } else {
        engine.compile_latex().await
    };
    engine.close_worker();

    let result = match result {
        Ok(result) => result,
        Err(err) => {
            if let texbridge_core::Error::ModuleAbort { log } = &err {
                eprintln!("{}", log);
            }
            return Err(err.into());
        }
    };

    let code = exit_code(&result);
    let output_path = options
        .output
        .clone()
        .unwrap_or_else(|| default_output(&options.project, &main_entry, &extension));

    if let Some(bytes) = &result.output {
        std::fs::write(&output_path, bytes)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(code);
    }

    match &result.failure {
        None => println!(
            "{}Wrote{} {} {}({} bytes, {:.2}s){}",
            colors::GREEN,
            colors::RESET,
            output_path.display(),
            colors::DIM,
            result.output.as_ref().map_or(0, Vec::len),
            start.elapsed().as_secs_f64(),
            colors::RESET
        ),
        Some(failure) => {
            eprintln!("{}", result.log);
            eprintln!("{}", "─".repeat(50));
            match failure {
                CompileFailure::NativeStatus { status } => eprintln!(
                    "{}Compilation failed{} with status {}",
                    colors::RED,
                    colors::RESET,
                    status
                ),
                CompileFailure::MissingOutput { path } => eprintln!(
                    "{}No output produced{}: {} is missing",
                    colors::YELLOW,
                    colors::RESET,
                    path
                ),
            }
        }
    }

    Ok(code)
}

/// Defaults (or `--config`), then environment overrides, then flags.
fn build_config(options: &CompileOptions) -> anyhow::Result<EngineConfig> {
    let mut config = match &options.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => {
            let variant: EngineVariant = options.engine.parse()?;
            EngineConfig::for_variant(variant, ".")
        }
    };
    config = config.apply_env()?;

    if let Some(module) = &options.module {
        config.module_path = module.clone();
    }
    if let Some(endpoint) = &options.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(main) = &options.main {
        config.main_entry = main.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Mirror the project tree into the engine's work root.
async fn upload_project(engine: &TexEngine, project: &Path) -> anyhow::Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(project)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
    {
        let entry = entry?;
        let relative = entry.path().strip_prefix(project)?;
        let virtual_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            engine.make_dir(&virtual_path).await?;
        } else if entry.file_type().is_file() {
            let contents = std::fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            engine.write_file(&virtual_path, contents).await?;
            files += 1;
        }
    }
    Ok(files)
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn default_output(project: &Path, main_entry: &str, extension: &str) -> PathBuf {
    let stem = Path::new(main_entry)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| main_entry.to_string());
    project.join(format!("{}{}", stem, extension))
}

/// Process exit code for a job. Only the low byte reaches the parent, so a
/// failing status that truncates to zero becomes 1.
fn exit_code(result: &JobResult) -> i32 {
    match &result.failure {
        None => 0,
        Some(CompileFailure::NativeStatus { status }) if status & 0xff == 0 => 1,
        Some(CompileFailure::NativeStatus { status }) => *status,
        Some(CompileFailure::MissingOutput { .. }) => EXIT_MISSING_OUTPUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(engine: &str) -> CompileOptions {
        CompileOptions {
            project: PathBuf::from("."),
            engine: engine.to_string(),
            module: None,
            main: None,
            endpoint: None,
            pdf: false,
            output: None,
            config: None,
            json: false,
        }
    }

    #[test]
    fn test_default_output() {
        assert_eq!(
            default_output(Path::new("/proj"), "main.tex", ".pdf"),
            PathBuf::from("/proj/main.pdf")
        );
        assert_eq!(
            default_output(Path::new("/proj"), "chapters/intro.tex", ".xdv"),
            PathBuf::from("/proj/intro.xdv")
        );
    }

    #[test]
    fn test_flags_override_defaults() {
        let mut opts = options("pdftex");
        opts.endpoint = Some("http://127.0.0.1:8000/pdftex/".to_string());
        opts.main = Some("thesis.tex".to_string());

        let config = build_config(&opts).unwrap();
        assert_eq!(config.variant, EngineVariant::PdfTeX);
        assert_eq!(config.endpoint, "http://127.0.0.1:8000/pdftex/");
        assert_eq!(config.main_entry, "thesis.tex");
    }

    #[test]
    fn test_unknown_engine() {
        assert!(build_config(&options("luatex")).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let mut result = JobResult {
            status: 0,
            log: String::new(),
            output: Some(Vec::new()),
            failure: None,
        };
        assert_eq!(exit_code(&result), 0);

        result.failure = Some(CompileFailure::NativeStatus { status: 3 });
        assert_eq!(exit_code(&result), 3);

        result.failure = Some(CompileFailure::NativeStatus { status: 256 });
        assert_eq!(exit_code(&result), 1);

        result.failure = Some(CompileFailure::NativeStatus { status: -512 });
        assert_eq!(exit_code(&result), 1);

        result.failure = Some(CompileFailure::NativeStatus { status: -1 });
        assert_eq!(exit_code(&result), -1);

        result.failure = Some(CompileFailure::MissingOutput {
            path: "/work/main.pdf".to_string(),
        });
        assert_eq!(exit_code(&result), 1);
    }
}
