//! Source-address list discovery and the provider that walks it.
//!
//! Lists are named `IPv6-<host>-<cc>.txt`, one address per line. The first
//! matching file in the directory wins; `<cc>` is a two-letter country code.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hyperpipe::{HttpHandle, NetworkBinding, NextRequest, TransferOptions, WorkProvider};

pub const DEFAULT_TARGET_URL: &str = "http://icanhazip.com/";
pub const DEFAULT_LIMIT: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("no IPv6-{host}-*.txt found in {dir}")]
    NotFound { host: String, dir: String },
    #[error("no country code in {0}")]
    NoCountry(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressList {
    pub path: PathBuf,
    pub country: String,
    pub addresses: Vec<IpAddr>,
}

/// The `<cc>` part of `IPv6-<host>-<cc>.txt`, matched case-insensitively.
///
/// Slices the original name, never a lowercased copy: lowercasing can change
/// the byte length of non-ASCII names.
fn list_suffix<'a>(file_name: &'a str, host: &str) -> Option<&'a str> {
    let prefix = format!("IPv6-{}-", host);
    let head = file_name.get(..prefix.len())?;
    if head.to_lowercase() != prefix.to_lowercase() {
        return None;
    }
    let rest = &file_name[prefix.len()..];
    let split = rest.len().checked_sub(".txt".len())?;
    let ext = rest.get(split..)?;
    ext.eq_ignore_ascii_case(".txt").then(|| &rest[..split])
}

/// Country code from a list file name, matched case-insensitively.
pub fn country_code(file_name: &str, host: &str) -> Option<String> {
    let country = list_suffix(file_name, host)?;
    let valid = country.chars().count() == 2
        && country.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then(|| country.to_string())
}

/// Parse one address per line: trimmed, lowercased, deduplicated in order,
/// capped at `limit`. Lines that are not addresses are skipped.
pub fn parse_addresses(text: &str, limit: usize) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for line in text.lines() {
        let line = line.trim().to_lowercase();
        if line.is_empty() {
            continue;
        }
        match format!("host!{}", line).parse::<NetworkBinding>() {
            Ok(NetworkBinding::Address(addr)) => {
                if seen.insert(addr) {
                    addresses.push(addr);
                    if addresses.len() == limit {
                        break;
                    }
                }
            }
            Ok(NetworkBinding::Interface(_)) | Err(_) => {
                tracing::warn!(line = %line, "Skipping malformed source address");
            }
        }
    }

    addresses
}

async fn find_list(dir: &Path, host: &str) -> Result<PathBuf, ListError> {
    let io_err = |source| ListError::Io {
        path: dir.display().to_string(),
        source,
    };

    let mut candidates = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let name = entry.file_name();
        if list_suffix(&name.to_string_lossy(), host).is_some() {
            candidates.push(entry.path());
        }
    }

    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ListError::NotFound {
            host: host.to_string(),
            dir: dir.display().to_string(),
        })
}

/// Find and read the address list for `host` in `dir`.
pub async fn load(dir: &Path, host: &str, limit: usize) -> Result<AddressList, ListError> {
    let path = find_list(dir, host).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let country =
        country_code(&file_name, host).ok_or_else(|| ListError::NoCountry(file_name.clone()))?;

    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ListError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let addresses = parse_addresses(&text, limit);

    tracing::info!(
        path = %path.display(),
        %country,
        addresses = addresses.len(),
        "Loaded source address list"
    );
    Ok(AddressList {
        path,
        country,
        addresses,
    })
}

/// Where the probe sends its requests.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub url: String,
    pub timeout: Duration,
    pub ca_bundle: Option<PathBuf>,
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self {
            url: DEFAULT_TARGET_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            ca_bundle: None,
        }
    }
}

/// Request context: which source address a response belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeContext {
    pub index: usize,
    pub address: IpAddr,
    pub label: String,
}

enum ListState {
    Unloaded,
    Loaded { addresses: Vec<IpAddr>, next: usize },
}

/// Provider issuing one request per source address.
///
/// The list is read lazily on the first pull; a missing or unusable list is
/// logged and ends the run with zero transfers.
pub struct IpListProvider {
    dir: PathBuf,
    host: String,
    limit: usize,
    target: ProbeTarget,
    state: ListState,
}

impl IpListProvider {
    pub fn new(dir: impl Into<PathBuf>, host: impl Into<String>, target: ProbeTarget) -> Self {
        Self {
            dir: dir.into(),
            host: host.into(),
            limit: DEFAULT_LIMIT,
            target,
            state: ListState::Unloaded,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn options_for(&self, address: IpAddr) -> TransferOptions {
        let mut options = TransferOptions::new(self.target.url.clone())
            .with_follow_redirects(true)
            .with_timeout(self.target.timeout)
            .with_capture_headers(true)
            .with_capture_body(true)
            .with_binding(NetworkBinding::Address(address));
        if let Some(ref ca_bundle) = self.target.ca_bundle {
            options = options.with_ca_bundle(ca_bundle.clone());
        }
        options
    }
}

#[async_trait]
impl WorkProvider<HttpHandle> for IpListProvider {
    type Context = ProbeContext;

    async fn next_request(&mut self, handle: &mut HttpHandle) -> NextRequest<ProbeContext> {
        if let ListState::Unloaded = self.state {
            let addresses = match load(&self.dir, &self.host, self.limit).await {
                Ok(list) => list.addresses,
                Err(e) => {
                    tracing::warn!(error = %e, "No source addresses to probe");
                    Vec::new()
                }
            };
            self.state = ListState::Loaded { addresses, next: 0 };
        }

        let ListState::Loaded { addresses, next } = &mut self.state else {
            return NextRequest::Exhausted;
        };
        let Some(address) = addresses.get(*next).copied() else {
            return NextRequest::Exhausted;
        };
        let index = *next;
        *next += 1;

        handle.configure(self.options_for(address));
        NextRequest::Ready(ProbeContext {
            index,
            address,
            label: format!("Get from ip #{}: {}", index, address),
        })
    }
}
