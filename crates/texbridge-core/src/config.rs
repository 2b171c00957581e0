//! Engine variants and their configuration.
//!
//! The three engine flavours differ only in the output extension they
//! produce, the remote endpoint serving their auxiliary files and the module
//! binary they run. All three share one code path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Client-side timeout applied to every remote resource fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(150);

/// Main entry file used until the host picks another one.
pub const DEFAULT_MAIN_ENTRY: &str = "main.tex";

/// Supported engine flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineVariant {
    /// XeTeX, producing extended DVI.
    XeTeX,
    /// dvipdfmx, turning extended DVI into PDF.
    Dvipdfmx,
    /// pdfTeX, producing PDF directly.
    PdfTeX,
}

impl EngineVariant {
    pub const ALL: [EngineVariant; 3] = [
        EngineVariant::XeTeX,
        EngineVariant::Dvipdfmx,
        EngineVariant::PdfTeX,
    ];

    /// Extension of the artifact a `compileLaTeX` job produces.
    pub fn extension(self) -> &'static str {
        match self {
            EngineVariant::XeTeX => ".xdv",
            EngineVariant::Dvipdfmx | EngineVariant::PdfTeX => ".pdf",
        }
    }

    /// Remote endpoint serving auxiliary files for this engine.
    pub fn endpoint(self) -> &'static str {
        match self {
            EngineVariant::XeTeX | EngineVariant::Dvipdfmx => {
                "https://texlive2.swiftlatex.com/xetex/"
            }
            EngineVariant::PdfTeX => "https://texlive2.swiftlatex.com/pdftex/",
        }
    }

    /// File name of the module binary.
    pub fn module_file(self) -> &'static str {
        match self {
            EngineVariant::XeTeX => "swiftlatexxetex.wasm",
            EngineVariant::Dvipdfmx => "swiftlatexdvipdfm.wasm",
            EngineVariant::PdfTeX => "swiftlatexpdftex.wasm",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineVariant::XeTeX => "xetex",
            EngineVariant::Dvipdfmx => "dvipdfmx",
            EngineVariant::PdfTeX => "pdftex",
        }
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EngineVariant::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown engine '{}', expected one of: xetex, dvipdfmx, pdftex",
                    s
                ))
            })
    }
}

/// Configuration for one engine handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine flavour.
    pub variant: EngineVariant,
    /// Path to the module binary.
    pub module_path: PathBuf,
    /// Output extension pushed into the worker at load time.
    pub extension: String,
    /// Remote endpoint prefix for auxiliary files.
    pub endpoint: String,
    /// Timeout for a single remote fetch.
    #[serde(with = "duration_secs", default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,
    /// Main entry file name, relative to the work root.
    #[serde(default = "default_main_entry")]
    pub main_entry: String,
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_main_entry() -> String {
    DEFAULT_MAIN_ENTRY.to_string()
}

impl EngineConfig {
    /// Defaults for `variant`, with the module binary looked up in `module_dir`.
    pub fn for_variant(variant: EngineVariant, module_dir: impl AsRef<Path>) -> Self {
        Self {
            variant,
            module_path: module_dir.as_ref().join(variant.module_file()),
            extension: variant.extension().to_string(),
            endpoint: variant.endpoint().to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            main_entry: default_main_entry(),
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TEXBRIDGE_ENDPOINT`, `TEXBRIDGE_MODULE` and
    /// `TEXBRIDGE_FETCH_TIMEOUT_SECS` overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(endpoint) = lookup("TEXBRIDGE_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(module) = lookup("TEXBRIDGE_MODULE") {
            self.module_path = PathBuf::from(module);
        }
        if let Some(secs) = lookup("TEXBRIDGE_FETCH_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                Error::Config(format!("TEXBRIDGE_FETCH_TIMEOUT_SECS is not a number: {}", secs))
            })?;
            self.fetch_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.extension.starts_with('.') || self.extension.len() < 2 {
            return Err(Error::Config(format!(
                "extension must look like '.pdf', got '{}'",
                self.extension
            )));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(Error::Config(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }
        if self.main_entry.is_empty() {
            return Err(Error::Config("main entry must not be empty".to_string()));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
