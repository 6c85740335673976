use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::chunks::sink::DEFAULT_EXPECTED_CHUNKS;

/// Default cache directory, relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = "cache";

/// File extension of cache entry containers
pub const ENTRY_EXTENSION: &str = "ckc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one container per cache entry
    pub cache_dir: PathBuf,

    /// Preallocation hint for new streams, in chunks
    pub expected_chunks: usize,

    /// Log the caller location whenever a stage is computed
    pub log_call_site: bool,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            expected_chunks: DEFAULT_EXPECTED_CHUNKS,
            log_call_site: true,
        }
    }
}
