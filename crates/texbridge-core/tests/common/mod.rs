//! Shared helpers for texbridge-core integration tests.
//!
//! `FakeTex` is an engine module written in Rust. It understands just enough
//! of a LaTeX source to exercise the bridge: class and package requests go
//! through the host's resource resolver, output lands in the work root, and
//! its memory is a byte array so leaked state between jobs is observable.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};

use texbridge_core::{
    EngineConfig, EngineModule, EngineVariant, Error, HostState, ModuleLoader, NativeEntry,
    Result, TexEngine,
};

/// Resource format the fake engine uses for classes and packages.
pub const TEX_FORMAT: i32 = 26;

/// Memory byte counting runs since the last restore.
const RUN_COUNTER: usize = 0;

/// Blocks a job until the test opens it.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.inner;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (open, cvar) = &*self.inner;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cvar.wait(guard).unwrap();
        }
    }
}

pub struct FakeTex {
    host: HostState,
    memory: Vec<u8>,
    main_entry: String,
    extension: &'static str,
    gate: Option<Gate>,
}

impl FakeTex {
    fn stem(&self) -> &str {
        let base = self.main_entry.rsplit('/').next().unwrap_or(&self.main_entry);
        base.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(base)
    }

    fn fail(&mut self, message: &str) -> Result<i32> {
        self.host.append_log(message);
        Ok(1)
    }

    fn compile_source(&mut self) -> Result<i32> {
        let runs = self.memory[RUN_COUNTER];
        self.memory[RUN_COUNTER] = runs + 1;
        if runs != 0 {
            return self.fail("! Fatal: engine state leaked from a previous run");
        }

        self.host.append_log("This is FakeTeX, Version 3.141592653");
        let path = format!("/work/{}", self.main_entry);
        let source = match self.host.fs.read_file(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return self.fail(&format!("! I can't find file `{}'.", self.main_entry)),
        };

        if source.contains("\\crash") {
            self.host.append_log("Engine crashed");
            return Err(Error::ModuleAbort {
                log: self.host.log.clone(),
            });
        }
        if source.contains("\\wait")
            && let Some(gate) = self.gate.clone()
        {
            gate.wait();
        }

        for line in source.lines() {
            let request = command_argument(line, "\\documentclass")
                .map(|class| format!("{}.cls", class))
                .or_else(|| command_argument(line, "\\usepackage").map(|pkg| format!("{}.sty", pkg)));
            let Some(request) = request else { continue };

            match self.host.resolve(&request, TEX_FORMAT) {
                Some(local) if self.host.fs.exists(&local) => {
                    self.host.append_log(&format!("({})", local));
                }
                _ => {
                    return self.fail(&format!("! LaTeX Error: File `{}' not found.", request));
                }
            }
        }

        if source.contains("\\nooutput") {
            self.host.append_log("No pages of output.");
            return Ok(0);
        }

        let output = format!("/work/{}{}", self.stem(), self.extension);
        self.host
            .fs
            .write_file(&output, format!("FAKE-OUTPUT:{}", source))?;
        self.host.append_log(&format!("Output written on {}.", output));
        Ok(0)
    }

    /// Like bibtex, exits with 2 when the document cites nothing.
    fn merge_bibliography(&mut self) -> Result<i32> {
        let path = format!("/work/{}", self.main_entry);
        let cites = self
            .host
            .fs
            .read_file(&path)
            .is_ok_and(|bytes| String::from_utf8_lossy(&bytes).contains("\\cite"));
        if cites {
            self.host.append_log("Database file #1: refs.bib");
            Ok(0)
        } else {
            self.host.append_log("I found no \\citation commands");
            Ok(2)
        }
    }

    fn dump_format(&mut self) -> Result<i32> {
        self.host.append_log("Beginning to dump on file xelatex.fmt");
        self.host.fs.write_file("/work/xelatex.fmt", "FAKE-FORMAT")?;
        Ok(0)
    }

    fn convert_to_pdf(&mut self) -> Result<i32> {
        let input = format!("/work/{}.xdv", self.stem());
        let Ok(dvi) = self.host.fs.read_file(&input) else {
            return self.fail(&format!("dvipdfmx:fatal: could not open {}", input));
        };
        let output = format!("/work/{}.pdf", self.stem());
        self.host.fs.write_file(&output, dvi)?;
        self.host.append_log(&format!("{} -> {}", input, output));
        Ok(0)
    }
}

/// `\cmd{arg}` at the start of a line.
fn command_argument<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    let rest = line.trim_start().strip_prefix(command)?;
    let rest = rest.strip_prefix('{')?;
    rest.split_once('}').map(|(arg, _)| arg)
}

impl EngineModule for FakeTex {
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
        match entry {
            NativeEntry::CompileLaTeX => self.compile_source(),
            NativeEntry::CompileBibtex => self.merge_bibliography(),
            NativeEntry::CompilePdf => self.convert_to_pdf(),
            NativeEntry::CompileFormat => self.dump_format(),
        }
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

/// Loads a `FakeTex` that writes `extension` from `compileLaTeX`.
pub struct FakeTexLoader {
    pub extension: &'static str,
    pub gate: Option<Gate>,
}

impl ModuleLoader for FakeTexLoader {
    fn load(&self, host: HostState) -> Result<Box<dyn EngineModule>> {
        Ok(Box::new(FakeTex {
            host,
            memory: vec![0; 256],
            main_entry: String::new(),
            extension: self.extension,
            gate: self.gate.clone(),
        }))
    }
}

/// Module that refuses to initialize.
pub struct FailingLoader;

impl ModuleLoader for FailingLoader {
    fn load(&self, _host: HostState) -> Result<Box<dyn EngineModule>> {
        Err(Error::ModuleLoad("initialization trapped".to_string()))
    }
}

/// Configuration whose endpoint points at `endpoint`.
pub fn config(variant: EngineVariant, endpoint: &str) -> EngineConfig {
    let mut config = EngineConfig::for_variant(variant, ".");
    config.endpoint = endpoint.to_string();
    config
}

/// A pdfTeX-flavoured fake engine talking to `endpoint`.
pub fn pdf_engine(endpoint: &str) -> TexEngine {
    TexEngine::with_loader(
        config(EngineVariant::PdfTeX, endpoint),
        FakeTexLoader {
            extension: ".pdf",
            gate: None,
        },
    )
}

/// Endpoint nothing listens on.
pub const OFFLINE_ENDPOINT: &str = "http://127.0.0.1:9/pdftex/";
