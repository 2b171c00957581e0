//! Remote resolution of auxiliary files (packages, fonts, formats).
//!
//! When the module asks for a file it cannot find locally, the resolver
//! fetches `<endpoint><format>/<name>` and stores the body under
//! `/tex/<file id>`. Both outcomes are remembered for the life of the worker:
//! a found file is never fetched twice, and a file the server reports as
//! absent (HTTP 301) is never asked for again. Transport errors and other
//! statuses are not remembered, so the next request retries.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::redirect::Policy;

use crate::error::{Error, Result};
use crate::vfs::{MemFs, TEX_CACHE_ROOT};

/// Response header carrying the storage name of a fetched file.
pub const FILE_ID_HEADER: &str = "fileid";

/// Status the resource server uses to say "no such file".
pub const ABSENT_STATUS: u16 = 301;

/// Outcome of one remote fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 200, with the body and the `fileid` header if present.
    Found {
        body: Vec<u8>,
        file_id: Option<String>,
    },
    /// The server says the file does not exist.
    Absent,
    /// Anything else; not cached.
    Failed(String),
}

/// Synchronous transport for resource fetches.
///
/// Fetches block the worker thread, which is what the module expects: the
/// callback has to return a path before the engine can continue.
pub trait ResourceFetcher: Send {
    fn fetch(&self, url: &str) -> FetchOutcome;
}

/// HTTP transport. Redirects are not followed since 301 means "absent".
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Must be called off any async runtime; the worker thread qualifies.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl ResourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> FetchOutcome {
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Failed(e.to_string()),
        };

        match response.status().as_u16() {
            200 => {
                let file_id = response
                    .headers()
                    .get(FILE_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match response.bytes() {
                    Ok(body) => FetchOutcome::Found {
                        body: body.to_vec(),
                        file_id,
                    },
                    Err(e) => FetchOutcome::Failed(e.to_string()),
                }
            }
            ABSENT_STATUS => FetchOutcome::Absent,
            status => FetchOutcome::Failed(format!("unexpected HTTP status {}", status)),
        }
    }
}

/// Cached outcome for one `(format, name)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    /// Stored at this path in the virtual filesystem.
    Resolved(String),
    /// The server reported the file as absent.
    NotFound,
}

/// Per-worker resource cache.
pub struct ResourceResolver {
    endpoint: Option<String>,
    found: HashMap<String, String>,
    missing: HashSet<String>,
    fetcher: Box<dyn ResourceFetcher>,
    fetches: u64,
}

impl ResourceResolver {
    pub fn new(fetcher: Box<dyn ResourceFetcher>) -> Self {
        Self {
            endpoint: None,
            found: HashMap::new(),
            missing: HashSet::new(),
            fetcher,
            fetches: 0,
        }
    }

    /// Replace the endpoint prefix. Cached outcomes are kept.
    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = Some(endpoint.into());
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Cached outcome for a request, without fetching.
    pub fn lookup(&self, name: &str, format: i32) -> Option<CacheEntry> {
        let key = cache_key(format, normalize(name));
        if self.missing.contains(&key) {
            return Some(CacheEntry::NotFound);
        }
        self.found.get(&key).cloned().map(CacheEntry::Resolved)
    }

    /// Number of remote fetches issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches
    }

    /// Resolve a file request from the module to a local path.
    ///
    /// Returns `None` when the file is unavailable, in which case the module
    /// proceeds as if it does not exist.
    pub fn resolve(&mut self, fs: &mut MemFs, name: &str, format: i32) -> Option<String> {
        let name = normalize(name);
        if name.is_empty() || name.contains('/') {
            tracing::debug!("Refusing to resolve path-like request {:?}", name);
            return None;
        }

        let key = cache_key(format, name);
        if self.missing.contains(&key) {
            return None;
        }
        if let Some(path) = self.found.get(&key) {
            return Some(path.clone());
        }

        let Some(endpoint) = self.endpoint.as_deref() else {
            tracing::warn!("No resource endpoint set, cannot fetch {}", key);
            return None;
        };
        let url = format!("{}{}", endpoint, key);
        tracing::info!("Start downloading {}", url);
        self.fetches += 1;

        match self.fetcher.fetch(&url) {
            FetchOutcome::Found { body, file_id } => {
                let file_id = file_id.unwrap_or_else(|| name.to_string());
                if !is_plain_file_name(&file_id) {
                    tracing::warn!("Rejecting file id {:?} for {}", file_id, key);
                    return None;
                }
                let path = format!("{}/{}", TEX_CACHE_ROOT, file_id);
                if let Err(e) = fs.write_file(&path, body) {
                    tracing::warn!("Failed to store {}: {}", path, e);
                    return None;
                }
                self.found.insert(key, path.clone());
                Some(path)
            }
            FetchOutcome::Absent => {
                tracing::debug!("{} is not available remotely", key);
                self.missing.insert(key);
                None
            }
            FetchOutcome::Failed(reason) => {
                tracing::warn!("Fetching {} failed: {}", url, reason);
                None
            }
        }
    }
}

/// Requests for previously fetched files arrive with the cache root prefix.
fn normalize(name: &str) -> &str {
    name.strip_prefix(TEX_CACHE_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(name)
}

fn cache_key(format: i32, name: &str) -> String {
    format!("{}/{}", format, name)
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
