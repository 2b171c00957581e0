//! texbridge CLI - compile a LaTeX project with a sandboxed engine module.

mod colors;
mod compile;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use texbridge_core::EngineVariant;

/// Exit code for failures of the bridge itself rather than the document.
const EXIT_BRIDGE_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "texbridge")]
#[command(about = "Compile LaTeX projects with a sandboxed TeX engine module")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a project directory
    Compile {
        /// Directory holding the project sources
        project: PathBuf,

        /// Engine flavour: xetex, dvipdfmx or pdftex
        #[arg(short, long, default_value = "xetex")]
        engine: String,

        /// Path to the engine module (.wasm or .wat)
        #[arg(long)]
        module: Option<PathBuf>,

        /// Main entry file, relative to the project directory
        #[arg(long)]
        main: Option<String>,

        /// Remote endpoint for auxiliary files
        #[arg(long)]
        endpoint: Option<String>,

        /// Run the PDF conversion entry point instead of the TeX pass
        #[arg(long)]
        pdf: bool,

        /// Where to write the artifact (default: next to the main file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// JSON engine configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the job result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the supported engine flavours
    Engines,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::Compile {
            project,
            engine,
            module,
            main,
            endpoint,
            pdf,
            output,
            config,
            json,
        } => {
            let options = compile::CompileOptions {
                project,
                engine,
                module,
                main,
                endpoint,
                pdf,
                output,
                config,
                json,
            };
            compile::execute(options).await
        }

        Commands::Engines => {
            list_engines();
            Ok(0)
        }
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}error:{} {:#}", colors::RED, colors::RESET, err);
            std::process::exit(EXIT_BRIDGE_ERROR);
        }
    }
}

fn list_engines() {
    for variant in EngineVariant::ALL {
        println!(
            "{}{:<10}{} {:<5} {:<24} {}",
            colors::BOLD,
            variant.name(),
            colors::RESET,
            variant.extension(),
            variant.module_file(),
            variant.endpoint()
        );
    }
}
