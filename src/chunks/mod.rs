//! Chunk sequences: records, identifier tagging, reading, writing and rechunking.

use crate::element::Element;
use crate::error::{CacheError, Result};
use crate::fingerprint::{fingerprint, Identifier};
use ndarray::{ArrayD, ArrayViewD, Axis};

pub mod rechunk;
pub mod sink;
pub mod source;

/// Shape of a record, fixed by the first item of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One array per item, stored as `data`
    Single,
    /// `n` row-aligned arrays per item, stored as `data0`, `data1`, ...
    Multi(usize),
}

impl Layout {
    pub fn streams(self) -> usize {
        match self {
            Layout::Single => 1,
            Layout::Multi(n) => n,
        }
    }

    /// Stream names used when the caller provides none
    pub fn default_names(self) -> Vec<String> {
        match self {
            Layout::Single => vec![DEFAULT_STREAM.to_string()],
            Layout::Multi(n) => (0..n).map(|i| format!("{DEFAULT_STREAM}{i}")).collect(),
        }
    }
}

pub const DEFAULT_STREAM: &str = "data";

/// Item of a chunk sequence: one chunk, or several parallel chunks
pub trait Record<T: Element>: Sized {
    fn layout(&self) -> Layout;

    fn arrays(&self) -> Vec<ArrayViewD<'_, T>>;

    fn from_arrays(arrays: Vec<ArrayD<T>>) -> Result<Self>;
}

impl<T: Element> Record<T> for ArrayD<T> {
    fn layout(&self) -> Layout {
        Layout::Single
    }

    fn arrays(&self) -> Vec<ArrayViewD<'_, T>> {
        vec![self.view()]
    }

    fn from_arrays(mut arrays: Vec<ArrayD<T>>) -> Result<Self> {
        match arrays.len() {
            1 => Ok(arrays.remove(0)),
            n => Err(CacheError::LayoutChanged {
                first: n,
                current: 1,
            }),
        }
    }
}

impl<T: Element> Record<T> for Vec<ArrayD<T>> {
    fn layout(&self) -> Layout {
        Layout::Multi(self.len())
    }

    fn arrays(&self) -> Vec<ArrayViewD<'_, T>> {
        self.iter().map(|a| a.view()).collect()
    }

    fn from_arrays(arrays: Vec<ArrayD<T>>) -> Result<Self> {
        Ok(arrays)
    }
}

/// Extent of the row axis; zero for 0-d arrays
pub fn rows<T>(chunk: &ArrayViewD<'_, T>) -> usize {
    if chunk.ndim() == 0 {
        0
    } else {
        chunk.len_of(Axis(0))
    }
}

/// Owned copy of `chunk` with its rows in reverse order
pub fn reverse_rows<T: Element>(chunk: ArrayD<T>) -> ArrayD<T> {
    let mut chunk = chunk;
    if chunk.ndim() > 0 {
        chunk.invert_axis(Axis(0));
    }
    chunk.as_standard_layout().into_owned()
}

/// Pass-through sequence carrying an identifier for downstream cache keys
#[derive(Debug)]
pub struct Tagged<I> {
    inner: I,
    identifier: Identifier,
}

impl<I> Tagged<I> {
    pub fn new(inner: I, identifier: Identifier) -> Self {
        Self { inner, identifier }
    }

    /// Tag with the fingerprint of `inputs`
    pub fn from_inputs<B: AsRef<[u8]>>(inner: I, inputs: impl IntoIterator<Item = B>) -> Self {
        Self::new(inner, fingerprint(inputs))
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

impl<I: Iterator> Iterator for Tagged<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Turn plain chunks into the `Result` items every sequence carries
pub fn ok_chunks<R, I>(chunks: I) -> impl Iterator<Item = Result<R>>
where
    I: IntoIterator<Item = R>,
{
    chunks.into_iter().map(Ok)
}
