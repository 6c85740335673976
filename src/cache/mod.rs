//! Compute-once, reuse-forever caching of chunk-producing pipeline stages.
//!
//! A stage is keyed by its name, version and the identifiers of its inputs. The
//! entry container is only considered complete once its `_finished` sentinel
//! has been written, which happens after every chunk is on disk.
//!
//! No locking is done: two processes computing the same key concurrently both
//! write to the same path.

use crate::chunks::sink::StreamSink;
use crate::chunks::source::{ChunkIter, ChunkSource};
use crate::chunks::{Record, Tagged, DEFAULT_STREAM};
use crate::config::CacheConfig;
use crate::element::Element;
use crate::error::Result;
use crate::fingerprint::{fingerprint, Identifier};
use crate::metrics::{CacheStats, StatsRecorder};
use crate::store::ContainerWriter;
use ndarray::ArrayD;
use std::fs;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub mod entry;

pub use entry::{EntryInfo, EntryKey, COMPUTATION_TIME_KEY, FINISHED_KEY};

/// Cache key and options of one pipeline stage
#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    version: String,
    inputs: Vec<Vec<u8>>,
    active: bool,
    cache_dir: Option<PathBuf>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0".to_string(),
            inputs: Vec::new(),
            active: true,
            cache_dir: None,
        }
    }

    /// Bump to invalidate earlier results of the same stage
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Append an input identifier (or any byte blob) to the key
    pub fn with_input(mut self, input: impl AsRef<[u8]>) -> Self {
        self.inputs.push(input.as_ref().to_vec());
        self
    }

    pub fn with_inputs<B: AsRef<[u8]>>(mut self, inputs: impl IntoIterator<Item = B>) -> Self {
        self.inputs
            .extend(inputs.into_iter().map(|i| i.as_ref().to_vec()));
        self
    }

    /// With `false` the producer is passed through untouched, only tagged
    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Override the configured cache directory for this stage
    pub fn in_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(&self.name, &self.version, self.inputs.as_slice())
    }
}

/// Result of [`ChunkCache::cache`]: a stored entry, or a tagged pass-through
pub enum CachedStage<I, T: Element, R = ArrayD<T>> {
    Stored(ChunkSource<T, R>),
    Passthrough(Tagged<I>),
}

impl<I, T: Element, R: Record<T>> CachedStage<I, T, R> {
    pub fn identifier(&self) -> Identifier {
        match self {
            CachedStage::Stored(source) => source.identifier(),
            CachedStage::Passthrough(tagged) => tagged.identifier(),
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, CachedStage::Stored(_))
    }

    /// The restartable source, unless caching was bypassed
    pub fn into_source(self) -> Option<ChunkSource<T, R>> {
        match self {
            CachedStage::Stored(source) => Some(source),
            CachedStage::Passthrough(_) => None,
        }
    }
}

impl<I, T, R> IntoIterator for CachedStage<I, T, R>
where
    I: Iterator<Item = Result<R>>,
    T: Element,
    R: Record<T>,
{
    type Item = Result<R>;
    type IntoIter = StageIter<I, T, R>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            CachedStage::Stored(source) => StageIter::Stored(source.iter()),
            CachedStage::Passthrough(tagged) => StageIter::Passthrough(tagged),
        }
    }
}

pub enum StageIter<I, T: Element, R> {
    Stored(ChunkIter<T, R>),
    Passthrough(Tagged<I>),
}

impl<I, T, R> Iterator for StageIter<I, T, R>
where
    I: Iterator<Item = Result<R>>,
    T: Element,
    R: Record<T>,
{
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            StageIter::Stored(iter) => iter.next(),
            StageIter::Passthrough(iter) => iter.next(),
        }
    }
}

/// Disk-backed stage cache rooted at a configured directory
#[derive(Debug, Default)]
pub struct ChunkCache {
    config: CacheConfig,
    stats: StatsRecorder,
}

impl ChunkCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            stats: StatsRecorder::default(),
        }
    }

    /// Cache rooted at `cache_dir` with otherwise default settings
    pub fn in_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self::new(CacheConfig::new(cache_dir))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn cache_dir<'a>(&'a self, stage: &'a Stage) -> &'a Path {
        stage
            .cache_dir
            .as_deref()
            .unwrap_or(self.config.cache_dir.as_path())
    }

    pub fn entry_path(&self, stage: &Stage) -> PathBuf {
        self.cache_dir(stage).join(stage.key().file_name())
    }

    /// Identifier attached to the stage output, whether cached or passed through
    pub fn stage_identifier(&self, stage: &Stage) -> Identifier {
        entry_identifier(&self.entry_path(stage))
    }

    /// Whether a complete entry exists for `stage`
    pub fn is_cached(&self, stage: &Stage) -> bool {
        entry::is_complete(&self.entry_path(stage))
    }

    /// Serve `stage` from disk, computing and persisting `producer` on a miss.
    ///
    /// On a hit the producer is never pulled. With `stage.active(false)` the
    /// producer is returned as-is, tagged with the same identifier a cached
    /// result would carry.
    #[track_caller]
    pub fn cache<I, T, R>(&self, producer: I, stage: &Stage) -> Result<CachedStage<I, T, R>>
    where
        I: Iterator<Item = Result<R>>,
        T: Element,
        R: Record<T>,
    {
        if !stage.active {
            self.stats.record_passthrough();
            return Ok(CachedStage::Passthrough(Tagged::new(
                producer,
                self.stage_identifier(stage),
            )));
        }
        self.materialize(producer, stage).map(CachedStage::Stored)
    }

    /// Like [`cache`](Self::cache) but always persists, ignoring `active`
    #[track_caller]
    pub fn materialize<I, T, R>(&self, producer: I, stage: &Stage) -> Result<ChunkSource<T, R>>
    where
        I: Iterator<Item = Result<R>>,
        T: Element,
        R: Record<T>,
    {
        let path = self.entry_path(stage);
        let identifier = entry_identifier(&path);
        let _span =
            tracing::info_span!("stage", name = %stage.name, version = %stage.version).entered();

        if path.exists() {
            if entry::is_complete(&path) {
                tracing::info!("using {}.", path.display());
                self.stats.record_hit(&stage.name);
                return Ok(ChunkSource::open_all(&path)?.with_identifier(identifier));
            }
            tracing::warn!("Discarding incomplete cache entry {:?}", path);
            fs::remove_file(&path)?;
            self.stats.record_discarded();
        }

        if self.config.log_call_site {
            let caller = Location::caller();
            tracing::info!(
                "Stage {} called from {}:{}, saving to {}",
                stage.name,
                caller.file(),
                caller.line(),
                path.display()
            );
        }

        fs::create_dir_all(self.cache_dir(stage))?;
        let started = Instant::now();
        if let Err(e) = self.write_entry::<I, T, R>(producer, &path) {
            if path.exists() {
                if let Err(cleanup) = fs::remove_file(&path) {
                    tracing::warn!("Failed to remove partial entry {:?}: {}", path, cleanup);
                }
            }
            return Err(e);
        }
        let elapsed = started.elapsed();

        let mut writer = ContainerWriter::open(&path)?;
        writer.put_scalar(COMPUTATION_TIME_KEY, &elapsed.as_secs_f64())?;
        writer.put_scalar(FINISHED_KEY, &true)?;
        writer.finish()?;

        self.stats.record_miss(&stage.name, elapsed);
        tracing::info!("Stage {} done in {:.3}s", stage.name, elapsed.as_secs_f64());

        Ok(ChunkSource::open_all(&path)?.with_identifier(identifier))
    }

    fn write_entry<I, T, R>(&self, producer: I, path: &Path) -> Result<()>
    where
        I: Iterator<Item = Result<R>>,
        T: Element,
        R: Record<T>,
    {
        let mut sink =
            StreamSink::<I, T, R>::new(producer, path).expected_chunks(self.config.expected_chunks);
        for record in sink.by_ref() {
            record?;
        }
        tracing::debug!(
            "Persisted {} records into streams {:?}",
            sink.consumed(),
            sink.stream_names()
        );
        Ok(())
    }

    /// Entries in the configured cache directory
    pub fn entries(&self) -> Result<Vec<EntryInfo>> {
        entry::list_entries(&self.config.cache_dir)
    }

    /// Delete entries of stage `name` with a version other than `keep_version`.
    ///
    /// Never run automatically; bumping a version leaves the old entries behind.
    pub fn prune_stale(&self, name: &str, keep_version: &str) -> Result<Vec<PathBuf>> {
        entry::prune_stale(&self.config.cache_dir, name, keep_version)
    }

    /// Delete entries that were interrupted before their sentinel was written
    pub fn prune_incomplete(&self) -> Result<Vec<PathBuf>> {
        entry::prune_incomplete(&self.config.cache_dir)
    }
}

fn entry_identifier(path: &Path) -> Identifier {
    let path = path.to_string_lossy();
    fingerprint([&*path, DEFAULT_STREAM])
}
