//! Restartable, lazily read chunk sequences backed by a container file.

use super::{reverse_rows, Record, Tagged};
use crate::element::{DType, Element};
use crate::error::{CacheError, Result};
use crate::fingerprint::{fingerprint, Identifier};
use crate::store::{ContainerIndex, ContainerReader};
use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice};
use std::marker::PhantomData;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Metadata of one stored stream, known without reading chunk data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Native rows per stored chunk
    pub chunk_rows: usize,
}

impl StreamInfo {
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn trailing_shape(&self) -> &[usize] {
        &self.shape[1..]
    }
}

/// Re-openable view over named streams of a container.
///
/// Every call to [`iter`](Self::iter) opens the file afresh, so a source can be
/// iterated any number of times. With several streams, items are row-aligned
/// tuples read at each stream's native chunk size.
pub struct ChunkSource<T: Element, R = ArrayD<T>> {
    path: PathBuf,
    streams: Vec<StreamInfo>,
    chunk_size: Option<usize>,
    reversed: bool,
    identifier: Identifier,
    _record: PhantomData<fn() -> (T, R)>,
}

impl<T: Element, R> Clone for ChunkSource<T, R> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            streams: self.streams.clone(),
            chunk_size: self.chunk_size,
            reversed: self.reversed,
            identifier: self.identifier,
            _record: PhantomData,
        }
    }
}

impl<T: Element, R> std::fmt::Debug for ChunkSource<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSource")
            .field("path", &self.path)
            .field("streams", &self.streams)
            .field("chunk_size", &self.chunk_size)
            .field("reversed", &self.reversed)
            .finish()
    }
}

impl<T: Element, R: Record<T>> ChunkSource<T, R> {
    /// View over the given streams, in the given order
    pub fn open(path: impl AsRef<Path>, names: &[&str]) -> Result<Self> {
        let path = path.as_ref();
        let reader = ContainerReader::open(path)?;
        let names = names.iter().map(|n| n.to_string()).collect();
        Self::from_index(path, reader.index(), names)
    }

    /// View over every stream of the container, in creation order
    pub fn open_all(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = ContainerReader::open(path)?;
        let names = reader
            .index()
            .arrays()
            .iter()
            .filter(|a| !a.name.starts_with('_'))
            .map(|a| a.name.clone())
            .collect();
        Self::from_index(path, reader.index(), names)
    }

    fn from_index(path: &Path, index: &ContainerIndex, names: Vec<String>) -> Result<Self> {
        let mut streams = Vec::with_capacity(names.len());
        for name in names {
            let array = index.array(&name).ok_or_else(|| {
                CacheError::InvalidArgument(format!("no stream {} in {}", name, path.display()))
            })?;
            if array.meta.dtype != T::DTYPE {
                return Err(CacheError::DTypeMismatch {
                    name,
                    stored: array.meta.dtype,
                    requested: T::DTYPE,
                });
            }
            streams.push(StreamInfo {
                shape: array.shape(),
                dtype: array.meta.dtype,
                chunk_rows: array.meta.chunk_rows.max(1),
                name,
            });
        }

        let path_str = path.to_string_lossy();
        let identifier = fingerprint(
            std::iter::once(&*path_str).chain(streams.iter().map(|s| s.name.as_str())),
        );

        Ok(Self {
            path: path.to_path_buf(),
            streams,
            chunk_size: None,
            reversed: false,
            identifier,
            _record: PhantomData,
        })
    }

    pub fn with_identifier(mut self, identifier: Identifier) -> Self {
        self.identifier = identifier;
        self
    }

    /// Read a single-stream source at `chunk_size` rows instead of the native size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CacheError::InvalidArgument("chunk size must be positive".into()));
        }
        if self.streams.len() > 1 {
            return Err(CacheError::InvalidArgument(
                "chunk size cannot be overridden for multi-stream sources".into(),
            ));
        }
        self.chunk_size = Some(chunk_size);
        Ok(self)
    }

    /// Same data, chunks in reverse order with rows reversed inside each chunk
    pub fn reversed(&self) -> Self {
        let mut reversed = self.clone();
        reversed.reversed = !self.reversed;
        reversed
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn identifier(&self) -> Identifier {
        if self.reversed {
            fingerprint([self.identifier.as_bytes().as_slice(), b"reversed".as_slice()])
        } else {
            self.identifier
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.streams
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.shape.as_slice())
    }

    /// Rows of the first stream
    pub fn rows(&self) -> usize {
        self.streams.first().map(StreamInfo::rows).unwrap_or(0)
    }

    /// Rows per yielded chunk of the first stream
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
            .or_else(|| self.streams.first().map(|s| s.chunk_rows))
            .unwrap_or(0)
    }

    /// Number of items one full iteration yields
    pub fn len(&self) -> usize {
        self.plan().iter().map(|&(rows, size)| rows.div_ceil(size)).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn plan(&self) -> Vec<(usize, usize)> {
        self.streams
            .iter()
            .map(|s| (s.rows(), self.chunk_size.unwrap_or(s.chunk_rows)))
            .collect()
    }

    /// Start a fresh pass over the stored data
    pub fn iter(&self) -> ChunkIter<T, R> {
        ChunkIter {
            path: self.path.clone(),
            streams: self.streams.clone(),
            plan: self.plan(),
            steps: self.len(),
            next_step: 0,
            reversed: self.reversed,
            reader: None,
            decoded: vec![None; self.streams.len()],
            finished: false,
            _record: PhantomData,
        }
    }

    /// Fresh pass that carries this source's identifier
    pub fn tagged(&self) -> Tagged<ChunkIter<T, R>> {
        Tagged::new(self.iter(), self.identifier())
    }
}

impl<'a, T: Element, R: Record<T>> IntoIterator for &'a ChunkSource<T, R> {
    type Item = Result<R>;
    type IntoIter = ChunkIter<T, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over a [`ChunkSource`]; owns the open file until exhausted or dropped
pub struct ChunkIter<T: Element, R> {
    path: PathBuf,
    streams: Vec<StreamInfo>,
    plan: Vec<(usize, usize)>,
    steps: usize,
    next_step: usize,
    reversed: bool,
    reader: Option<ContainerReader>,
    decoded: Vec<Option<(usize, ArrayD<T>)>>,
    finished: bool,
    _record: PhantomData<fn() -> R>,
}

impl<T: Element, R: Record<T>> ChunkIter<T, R> {
    fn read_step(&mut self, step: usize) -> Result<R> {
        if self.reader.is_none() {
            self.reader = Some(ContainerReader::open(&self.path)?);
        }

        let mut arrays = Vec::with_capacity(self.streams.len());
        for stream in 0..self.streams.len() {
            let (rows, size) = self.plan[stream];
            let start = (step * size).min(rows);
            let end = (start + size).min(rows);
            let chunk = self.read_rows(stream, start..end)?;
            arrays.push(if self.reversed {
                reverse_rows(chunk)
            } else {
                chunk
            });
        }
        R::from_arrays(arrays)
    }

    fn read_rows(&mut self, stream: usize, range: Range<usize>) -> Result<ArrayD<T>> {
        let info = &self.streams[stream];
        if range.is_empty() {
            let mut shape = vec![0];
            shape.extend_from_slice(info.trailing_shape());
            return Ok(ArrayD::from_shape_vec(IxDyn(&shape), Vec::new())?);
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(CacheError::InvalidArgument("container not open".into())),
        };

        let mut pieces = Vec::new();
        let mut row = range.start;
        while row < range.end {
            let (chunk_idx, chunk_ref) = {
                let array = reader.index().array(&info.name).ok_or_else(|| {
                    CacheError::CorruptEntry {
                        path: self.path.clone(),
                        reason: format!("stream {} disappeared", info.name),
                    }
                })?;
                let idx = array.chunk_for_row(row).ok_or_else(|| CacheError::CorruptEntry {
                    path: self.path.clone(),
                    reason: format!("stream {} has no row {}", info.name, row),
                })?;
                (idx, array.chunks[idx])
            };

            let cached = matches!(&self.decoded[stream], Some((idx, _)) if *idx == chunk_idx);
            if !cached {
                let chunk = reader.read_chunk::<T>(&info.name, chunk_idx)?;
                self.decoded[stream] = Some((chunk_idx, chunk));
            }
            let Some((_, chunk)) = &self.decoded[stream] else {
                return Err(CacheError::InvalidArgument("chunk decode cache empty".into()));
            };

            let local_start = row - chunk_ref.start_row;
            let local_end = range.end.min(chunk_ref.start_row + chunk_ref.rows) - chunk_ref.start_row;
            pieces.push(
                chunk
                    .slice_axis(Axis(0), Slice::from(local_start..local_end))
                    .to_owned(),
            );
            row = chunk_ref.start_row + local_end;
        }

        if pieces.len() == 1 {
            return Ok(pieces.remove(0));
        }
        let views: Vec<_> = pieces.iter().map(|p| p.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

impl<T: Element, R: Record<T>> Iterator for ChunkIter<T, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.next_step >= self.steps {
            self.reader = None;
            return None;
        }

        let step = if self.reversed {
            self.steps - 1 - self.next_step
        } else {
            self.next_step
        };
        self.next_step += 1;

        match self.read_step(step) {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.finished = true;
                self.reader = None;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.finished {
            0
        } else {
            self.steps - self.next_step
        };
        (0, Some(remaining))
    }
}
