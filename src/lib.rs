//! # chunkcache
//!
//! **Compute-once caching for chunked array pipelines**
//!
//! Long-running numerical pipelines are written as lazy sequences of array
//! chunks. `chunkcache` persists the output of any pipeline stage to disk the
//! first time it runs and serves it from there on every later run, keyed by
//! the stage name, a version string and the identifiers of its inputs.
//!
//! ## Core Concepts
//!
//! - **Chunk sequences**: any `Iterator<Item = Result<R>>` where `R` is one
//!   `ndarray::ArrayD<T>` or a `Vec` of row-aligned arrays
//! - **Identifiers**: SHA-256 fingerprints naming a sequence, fed into the
//!   keys of downstream stages
//! - **Entries**: one append-only container per stage, only trusted once its
//!   completion sentinel is on disk
//! - **Sources**: restartable readers of an entry, forward or reversed
//!
//! ## Quick Start
//!
//! ```rust
//! use chunkcache::{ok_chunks, ChunkCache, ChunkSource, Stage};
//! use ndarray::Array1;
//!
//! # fn main() -> chunkcache::Result<()> {
//! # let dir = tempfile::tempdir()?;
//! let cache = ChunkCache::in_dir(dir.path());
//! let stage = Stage::new("levels").with_version("1");
//!
//! let producer = ok_chunks((0..4).map(|i| Array1::from_elem(25, i as f64).into_dyn()));
//! let levels: ChunkSource<f64> = cache.materialize(producer, &stage)?;
//! assert_eq!(levels.rows(), 100);
//!
//! // A second run never touches its producer
//! let again: ChunkSource<f64> = cache.materialize(std::iter::empty(), &stage)?;
//! let total = chunkcache::sum(again.iter())?;
//! assert_eq!(total.sum(), 150.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Streaming sink**: chunks are persisted while they flow downstream
//! - **Rechunking**: regroup any sequence into fixed-size chunks
//! - **Zero-phase filtering**: two cached causal passes over a reversed source
//! - **Maintenance**: list entries, prune stale versions and interrupted runs
//! - **Metrics**: hit/miss counters, optionally exported through `metrics`

pub mod cache;
pub mod chunks;
pub mod compression;
pub mod config;
pub mod element;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod metrics;
pub mod reduce;
pub mod store;

// Re-export main types
pub use cache::{CachedStage, ChunkCache, EntryInfo, EntryKey, Stage};
pub use chunks::rechunk::{rechunk, Rechunk};
pub use chunks::sink::{StreamNames, StreamSink};
pub use chunks::source::{ChunkIter, ChunkSource, StreamInfo};
pub use chunks::{ok_chunks, Layout, Record, Tagged};
pub use compression::DeflateCompression;
pub use config::CacheConfig;
pub use element::{DType, Element};
pub use error::{CacheError, Result};
pub use filter::{zero_phase_filter, FilterInit, Sos, SosFilt};
pub use fingerprint::{fingerprint, Identifier};
pub use metrics::CacheStats;
pub use reduce::{batch_mean, concatenate, mean, sum, unwrap};
