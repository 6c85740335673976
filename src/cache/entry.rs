//! Naming, inspection and explicit cleanup of cache entries on disk.

use crate::config::ENTRY_EXTENSION;
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::store::ContainerReader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Scalar written last; an entry without it is incomplete
pub const FINISHED_KEY: &str = "_finished";

/// Scalar holding the seconds spent computing the entry
pub const COMPUTATION_TIME_KEY: &str = "_computation_time";

/// `{name}.{version}.{input hash}` part of an entry file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
    pub name: String,
    pub version: String,
    pub input_hash: String,
}

impl EntryKey {
    pub fn new<B: AsRef<[u8]>>(name: &str, version: &str, inputs: &[B]) -> Self {
        let input_hash = if inputs.is_empty() {
            "0".to_string()
        } else {
            fingerprint(inputs).to_hex()
        };
        Self {
            name: name.to_string(),
            version: version.to_string(),
            input_hash,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.name, self.version, self.input_hash, ENTRY_EXTENSION
        )
    }

    /// Parse a file name produced by [`file_name`](Self::file_name).
    ///
    /// Dots inside the name are kept; a dotted version is read as part of the name.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{ENTRY_EXTENSION}"))?;
        let (rest, input_hash) = stem.rsplit_once('.')?;
        let (name, version) = rest.rsplit_once('.')?;
        if name.is_empty() || version.is_empty() || input_hash.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            version: version.to_string(),
            input_hash: input_hash.to_string(),
        })
    }
}

/// Whether the container at `path` carries a readable completion sentinel
pub fn is_complete(path: &Path) -> bool {
    match ContainerReader::open(path).and_then(|r| r.scalar::<bool>(FINISHED_KEY)) {
        Ok(finished) => finished.unwrap_or(false),
        Err(e) => {
            tracing::debug!("Cache entry {:?} unreadable: {}", path, e);
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub input_hash: String,
    pub complete: bool,
    /// Seconds recorded when the entry was computed
    pub computation_time: Option<f64>,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl EntryInfo {
    fn inspect(path: PathBuf, key: EntryKey) -> Result<Self> {
        let metadata = fs::metadata(&path)?;
        let (complete, computation_time) = match ContainerReader::open(&path) {
            Ok(reader) => (
                reader.scalar::<bool>(FINISHED_KEY).ok().flatten().unwrap_or(false),
                reader.scalar::<f64>(COMPUTATION_TIME_KEY).ok().flatten(),
            ),
            Err(_) => (false, None),
        };
        Ok(Self {
            path,
            name: key.name,
            version: key.version,
            input_hash: key.input_hash,
            complete,
            computation_time,
            size_bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

/// Every entry container in `dir`, sorted by path; a missing directory is empty
pub fn list_entries(dir: &Path) -> Result<Vec<EntryInfo>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let file_name = dir_entry.file_name();
        let Some(key) = file_name.to_str().and_then(EntryKey::parse) else {
            continue;
        };
        entries.push(EntryInfo::inspect(dir_entry.path(), key)?);
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn remove_all(paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    for path in &paths {
        fs::remove_file(path)?;
        tracing::info!("Removed cache entry {:?}", path);
    }
    Ok(paths)
}

/// Delete entries of stage `name` whose version differs from `keep_version`
pub fn prune_stale(dir: &Path, name: &str, keep_version: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{name}.");
    let suffix = format!(".{ENTRY_EXTENSION}");
    let stale = list_entries(dir)?
        .into_iter()
        .filter_map(|entry| {
            let file_name = entry.path.file_name()?.to_str()?.to_string();
            let middle = file_name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
            let (version, _) = middle.rsplit_once('.')?;
            (version != keep_version).then_some(entry.path)
        })
        .collect();
    remove_all(stale)
}

/// Delete entries lacking a completion sentinel
pub fn prune_incomplete(dir: &Path) -> Result<Vec<PathBuf>> {
    let incomplete = list_entries(dir)?
        .into_iter()
        .filter(|entry| !entry.complete)
        .map(|entry| entry.path)
        .collect();
    remove_all(incomplete)
}
