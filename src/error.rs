use std::path::PathBuf;
use thiserror::Error;

use crate::element::DType;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt cache entry {path:?}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    #[error("dtype mismatch for stream {name}: stored {stored:?}, requested {requested:?}")]
    DTypeMismatch {
        name: String,
        stored: DType,
        requested: DType,
    },

    #[error("shape mismatch: expected trailing shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("record layout changed from {first} to {current} streams")]
    LayoutChanged { first: usize, current: usize },

    #[error("{rows} rows left over after batching, set allow_remainder if that is ok")]
    RemainderLeftOver { rows: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("sequence yielded no chunks")]
    EmptySequence,

    #[error(transparent)]
    Producer(#[from] anyhow::Error),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<ndarray::ShapeError> for CacheError {
    fn from(e: ndarray::ShapeError) -> Self {
        CacheError::InvalidArgument(format!("array shape: {e}"))
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
