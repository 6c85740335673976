//! Single-file container of named append-only arrays and small scalars.
//!
//! Layout: an 8-byte magic followed by frames
//! `[kind u8][name len u16 LE][name][payload len u64 LE][payload]`.
//! Opening a container scans frame headers only; chunk payloads are read on
//! demand. A frame cut short by an interrupted write makes the whole
//! container unreadable.

use crate::compression::DeflateCompression;
use crate::element::{from_bytes, to_bytes, DType, Element};
use crate::error::{CacheError, Result};
use bytes::{BufMut, BytesMut};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"CHNKCTR1";
const FRAME_HEADER_LEN: u64 = 1 + 2 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Array = 1,
    Chunk = 2,
    Scalar = 3,
}

impl FrameKind {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameKind::Array),
            2 => Some(FrameKind::Chunk),
            3 => Some(FrameKind::Scalar),
            _ => None,
        }
    }
}

/// Schema of one stored array, fixed by its first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub dtype: DType,
    pub trailing_shape: Vec<usize>,
    /// Rows per stored chunk, used as the default read granularity
    pub chunk_rows: usize,
    /// Preallocation hint, informational only
    pub expected_rows: usize,
}

impl ArrayMeta {
    pub fn row_len(&self) -> usize {
        self.trailing_shape.iter().product()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkRef {
    offset: u64,
    len: u64,
    pub start_row: usize,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ArrayIndex {
    pub name: String,
    pub meta: ArrayMeta,
    pub chunks: Vec<ChunkRef>,
    pub rows: usize,
}

impl ArrayIndex {
    /// Full shape, first dimension included
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.meta.trailing_shape.len() + 1);
        shape.push(self.rows);
        shape.extend_from_slice(&self.meta.trailing_shape);
        shape
    }

    /// Index of the stored chunk holding `row`
    pub fn chunk_for_row(&self, row: usize) -> Option<usize> {
        if row >= self.rows {
            return None;
        }
        let idx = self.chunks.partition_point(|c| c.start_row + c.rows <= row);
        (idx < self.chunks.len()).then_some(idx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerIndex {
    arrays: Vec<ArrayIndex>,
    scalars: HashMap<String, serde_json::Value>,
}

impl ContainerIndex {
    /// Arrays in creation order
    pub fn arrays(&self) -> &[ArrayIndex] {
        &self.arrays
    }

    pub fn array(&self, name: &str) -> Option<&ArrayIndex> {
        self.arrays.iter().find(|a| a.name == name)
    }

    fn array_mut(&mut self, name: &str) -> Option<&mut ArrayIndex> {
        self.arrays.iter_mut().find(|a| a.name == name)
    }

    pub fn scalar(&self, name: &str) -> Option<&serde_json::Value> {
        self.scalars.get(name)
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> CacheError {
    CacheError::CorruptEntry {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_or_corrupt(reader: &mut impl Read, buf: &mut [u8], path: &Path) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            corrupt(path, "truncated frame")
        } else {
            CacheError::Io(e)
        }
    })
}

/// Walk all frame headers, returning the index and the end offset
fn scan(path: &Path) -> Result<(ContainerIndex, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    read_or_corrupt(&mut reader, &mut magic, path)?;
    if &magic != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }

    let mut index = ContainerIndex::default();
    let mut pos = MAGIC.len() as u64;

    while pos < file_len {
        let mut kind = [0u8; 1];
        read_or_corrupt(&mut reader, &mut kind, path)?;
        let kind = FrameKind::from_u8(kind[0])
            .ok_or_else(|| corrupt(path, format!("unknown frame kind {}", kind[0])))?;

        let mut name_len = [0u8; 2];
        read_or_corrupt(&mut reader, &mut name_len, path)?;
        let mut name = vec![0u8; u16::from_le_bytes(name_len) as usize];
        read_or_corrupt(&mut reader, &mut name, path)?;
        let name = String::from_utf8(name).map_err(|_| corrupt(path, "frame name is not UTF-8"))?;

        let mut payload_len = [0u8; 8];
        read_or_corrupt(&mut reader, &mut payload_len, path)?;
        let payload_len = u64::from_le_bytes(payload_len);

        let payload_start = pos + FRAME_HEADER_LEN + name.len() as u64;
        let frame_end = payload_start
            .checked_add(payload_len)
            .ok_or_else(|| corrupt(path, "frame length overflow"))?;
        if frame_end > file_len {
            return Err(corrupt(path, format!("frame {name} runs past end of file")));
        }

        match kind {
            FrameKind::Array => {
                let mut payload = vec![0u8; payload_len as usize];
                read_or_corrupt(&mut reader, &mut payload, path)?;
                let meta: ArrayMeta = serde_json::from_slice(&payload)?;
                if index.array(&name).is_some() {
                    return Err(corrupt(path, format!("array {name} declared twice")));
                }
                index.arrays.push(ArrayIndex {
                    name,
                    meta,
                    chunks: Vec::new(),
                    rows: 0,
                });
            }
            FrameKind::Chunk => {
                if payload_len < 8 {
                    return Err(corrupt(path, format!("chunk frame of {name} too short")));
                }
                let mut rows = [0u8; 8];
                read_or_corrupt(&mut reader, &mut rows, path)?;
                let rows = u64::from_le_bytes(rows) as usize;
                let array = index
                    .array_mut(&name)
                    .ok_or_else(|| corrupt(path, format!("chunk for undeclared array {name}")))?;
                array.chunks.push(ChunkRef {
                    offset: payload_start + 8,
                    len: payload_len - 8,
                    start_row: array.rows,
                    rows,
                });
                array.rows += rows;
                reader.seek_relative((payload_len - 8) as i64)?;
            }
            FrameKind::Scalar => {
                let mut payload = vec![0u8; payload_len as usize];
                read_or_corrupt(&mut reader, &mut payload, path)?;
                index
                    .scalars
                    .insert(name, serde_json::from_slice(&payload)?);
            }
        }

        pos = frame_end;
    }

    Ok((index, pos))
}

/// Append handle on a container file.
///
/// Buffered frames are flushed when the writer is dropped; [`finish`](Self::finish)
/// additionally syncs the file and reports flush failures.
pub struct ContainerWriter {
    path: PathBuf,
    file: BufWriter<File>,
    index: ContainerIndex,
    offset: u64,
    codec: DeflateCompression,
}

impl ContainerWriter {
    /// Open `path` for appending, creating it when absent
    pub fn open(path: &Path) -> Result<Self> {
        let existing = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let (index, offset) = if existing {
            scan(path)?
        } else {
            (ContainerIndex::default(), 0)
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            index,
            offset,
            codec: DeflateCompression::default(),
        };

        if !existing {
            writer.file.write_all(MAGIC)?;
            writer.offset = MAGIC.len() as u64;
        }

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &ContainerIndex {
        &self.index
    }

    /// Declare a new array; a name that already exists is a conflict
    pub fn create_array(&mut self, name: &str, meta: ArrayMeta) -> Result<()> {
        if self.index.array(name).is_some() {
            return Err(CacheError::Conflict(format!(
                "{} in {} already contains data",
                name,
                self.path.display()
            )));
        }
        let payload = serde_json::to_vec(&meta)?;
        self.write_frame(FrameKind::Array, name, &[&payload])?;
        self.index.arrays.push(ArrayIndex {
            name: name.to_string(),
            meta,
            chunks: Vec::new(),
            rows: 0,
        });
        Ok(())
    }

    pub fn append<T: Element>(&mut self, name: &str, chunk: &ArrayViewD<'_, T>) -> Result<()> {
        let array = self.index.array(name).ok_or_else(|| {
            CacheError::InvalidArgument(format!("array {name} has not been created"))
        })?;
        if array.meta.dtype != T::DTYPE {
            return Err(CacheError::DTypeMismatch {
                name: name.to_string(),
                stored: array.meta.dtype,
                requested: T::DTYPE,
            });
        }
        if chunk.ndim() == 0 || chunk.shape()[1..] != array.meta.trailing_shape[..] {
            return Err(CacheError::ShapeMismatch {
                expected: array.meta.trailing_shape.clone(),
                actual: chunk.shape().get(1..).unwrap_or_default().to_vec(),
            });
        }

        let rows = chunk.len_of(Axis(0));
        let standard = chunk.as_standard_layout();
        let gathered: Vec<T>;
        let values = match standard.as_slice() {
            Some(values) => values,
            None => {
                gathered = standard.iter().copied().collect();
                &gathered
            }
        };
        let compressed = self.codec.compress(to_bytes(values))?;
        let rows_le = (rows as u64).to_le_bytes();
        let payload_start = self.write_frame(FrameKind::Chunk, name, &[&rows_le, &compressed])?;

        if let Some(array) = self.index.array_mut(name) {
            array.chunks.push(ChunkRef {
                offset: payload_start + rows_le.len() as u64,
                len: compressed.len() as u64,
                start_row: array.rows,
                rows,
            });
            array.rows += rows;
        }
        Ok(())
    }

    /// Store a small named value; a later write under the same name wins
    pub fn put_scalar<V: Serialize>(&mut self, name: &str, value: &V) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let payload = serde_json::to_vec(&value)?;
        self.write_frame(FrameKind::Scalar, name, &[&payload])?;
        self.index.scalars.insert(name.to_string(), value);
        Ok(())
    }

    fn write_frame(&mut self, kind: FrameKind, name: &str, payload: &[&[u8]]) -> Result<u64> {
        let name_len = u16::try_from(name.len())
            .map_err(|_| CacheError::InvalidArgument(format!("name too long: {name}")))?;
        let payload_len: usize = payload.iter().map(|p| p.len()).sum();

        let mut header = BytesMut::with_capacity(FRAME_HEADER_LEN as usize + name.len());
        header.put_u8(kind as u8);
        header.put_u16_le(name_len);
        header.put_slice(name.as_bytes());
        header.put_u64_le(payload_len as u64);

        self.file.write_all(&header)?;
        for part in payload {
            self.file.write_all(part)?;
        }

        let payload_start = self.offset + FRAME_HEADER_LEN + name.len() as u64;
        self.offset = payload_start + payload_len as u64;
        Ok(payload_start)
    }

    /// Flush and sync; the handle is released on return
    pub fn finish(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

/// Read handle on a container file
pub struct ContainerReader {
    path: PathBuf,
    file: File,
    index: ContainerIndex,
    codec: DeflateCompression,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self> {
        let (index, _) = scan(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: File::open(path)?,
            index,
            codec: DeflateCompression::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &ContainerIndex {
        &self.index
    }

    pub fn scalar<V: DeserializeOwned>(&self, name: &str) -> Result<Option<V>> {
        match self.index.scalar(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Decode the `chunk`-th stored chunk of array `name`
    pub fn read_chunk<T: Element>(&mut self, name: &str, chunk: usize) -> Result<ArrayD<T>> {
        let array = self.index.array(name).ok_or_else(|| {
            CacheError::InvalidArgument(format!(
                "no array {} in {}",
                name,
                self.path.display()
            ))
        })?;
        if array.meta.dtype != T::DTYPE {
            return Err(CacheError::DTypeMismatch {
                name: name.to_string(),
                stored: array.meta.dtype,
                requested: T::DTYPE,
            });
        }
        let chunk_ref = *array.chunks.get(chunk).ok_or_else(|| {
            CacheError::InvalidArgument(format!("array {name} has no chunk {chunk}"))
        })?;

        let mut packed = vec![0u8; chunk_ref.len as usize];
        self.file.seek(SeekFrom::Start(chunk_ref.offset))?;
        read_or_corrupt(&mut self.file, &mut packed, &self.path)?;

        let raw_len = chunk_ref.rows * array.meta.row_len() * T::DTYPE.size();
        let raw = self.codec.decompress(&packed, raw_len)?;
        let values = from_bytes::<T>(&raw)?;

        let mut shape = vec![chunk_ref.rows];
        shape.extend_from_slice(&array.meta.trailing_shape);
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
    }
}
