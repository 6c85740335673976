//! Tee that persists a chunk sequence while forwarding it unchanged.

use super::{rows, Layout, Record};
use crate::element::Element;
use crate::error::{CacheError, Result};
use crate::store::{ArrayMeta, ContainerWriter};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Default preallocation hint, in chunks
pub const DEFAULT_EXPECTED_CHUNKS: usize = 128;

/// Stream naming for a sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamNames {
    /// `data`, or `data0`, `data1`, ... for multi-stream records
    #[default]
    Default,
    /// The same name for every stream; a conflict for multi-stream records
    Single(String),
    /// One name per stream, in record order
    Many(Vec<String>),
}

impl StreamNames {
    fn resolve(&self, layout: Layout) -> Result<Vec<String>> {
        let names = match self {
            StreamNames::Default => layout.default_names(),
            StreamNames::Single(name) => vec![name.clone(); layout.streams()],
            StreamNames::Many(names) => {
                if names.len() != layout.streams() {
                    return Err(CacheError::InvalidArgument(format!(
                        "{} stream names given for {} streams",
                        names.len(),
                        layout.streams()
                    )));
                }
                names.clone()
            }
        };
        Ok(names)
    }
}

type Preprocessor<R> = Box<dyn FnMut(&R) -> Result<R>>;

enum SinkState {
    Pending,
    Writing {
        writer: ContainerWriter,
        layout: Layout,
    },
    Done,
}

/// Iterator adapter appending every `skip`-th record to a container.
///
/// The container is opened when the first record arrives and released when
/// the source is exhausted, fails, or the sink is dropped mid-iteration.
pub struct StreamSink<I, T, R> {
    source: I,
    path: PathBuf,
    names: StreamNames,
    expected_chunks: usize,
    skip: usize,
    preprocessor: Option<Preprocessor<R>>,
    state: SinkState,
    streams: Vec<String>,
    consumed: usize,
    _element: PhantomData<fn() -> T>,
}

impl<I, T, R> StreamSink<I, T, R>
where
    I: Iterator<Item = Result<R>>,
    T: Element,
    R: Record<T>,
{
    pub fn new(source: I, path: impl AsRef<Path>) -> Self {
        Self {
            source,
            path: path.as_ref().to_path_buf(),
            names: StreamNames::Default,
            expected_chunks: DEFAULT_EXPECTED_CHUNKS,
            skip: 1,
            preprocessor: None,
            state: SinkState::Pending,
            streams: Vec::new(),
            consumed: 0,
            _element: PhantomData,
        }
    }

    pub fn names(mut self, names: StreamNames) -> Self {
        self.names = names;
        self
    }

    pub fn expected_chunks(mut self, expected_chunks: usize) -> Self {
        self.expected_chunks = expected_chunks;
        self
    }

    /// Persist only every `skip`-th record; all records are still forwarded
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Transform applied to the persisted copy only
    pub fn preprocess<F>(mut self, f: F) -> Self
    where
        F: FnMut(&R) -> Result<R> + 'static,
    {
        self.preprocessor = Some(Box::new(f));
        self
    }

    /// Names of the streams created so far
    pub fn stream_names(&self) -> &[String] {
        &self.streams
    }

    /// Records pulled from the source
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self, first: &R) -> Result<()> {
        let layout = first.layout();
        let names = self.names.resolve(layout)?;
        let mut occupied = HashSet::new();
        for name in &names {
            if !occupied.insert(name.as_str()) {
                return Err(CacheError::Conflict(format!(
                    "tried to write twice to stream {} in {}",
                    name,
                    self.path.display()
                )));
            }
        }

        let mut writer = ContainerWriter::open(&self.path)?;
        for (name, chunk) in names.iter().zip(first.arrays()) {
            if chunk.ndim() == 0 {
                return Err(CacheError::InvalidArgument(format!(
                    "stream {name} received a 0-d chunk"
                )));
            }
            let chunk_rows = rows(&chunk).max(1);
            writer.create_array(
                name,
                ArrayMeta {
                    dtype: T::DTYPE,
                    trailing_shape: chunk.shape()[1..].to_vec(),
                    chunk_rows,
                    expected_rows: self.expected_chunks * chunk_rows,
                },
            )?;
        }

        tracing::debug!(
            "Initialized {} stream(s) {:?} in {:?}",
            names.len(),
            names,
            self.path
        );
        self.streams = names;
        self.state = SinkState::Writing { writer, layout };
        Ok(())
    }

    fn persist(&mut self, record: &R) -> Result<()> {
        if self.skip == 0 {
            return Err(CacheError::InvalidArgument("skip must be at least 1".into()));
        }
        if self.consumed % self.skip != 0 {
            return Ok(());
        }

        let processed;
        let stored = match self.preprocessor.as_mut() {
            Some(preprocess) => {
                processed = preprocess(record)?;
                &processed
            }
            None => record,
        };

        if matches!(self.state, SinkState::Pending) {
            // Native chunk rows come from the first record carrying data
            let empty = stored
                .arrays()
                .iter()
                .all(|chunk| chunk.ndim() > 0 && rows(chunk) == 0);
            if empty {
                return Ok(());
            }
            self.open(stored)?;
        }

        if let SinkState::Writing { writer, layout } = &mut self.state {
            let current = stored.layout();
            if current != *layout {
                return Err(CacheError::LayoutChanged {
                    first: layout.streams(),
                    current: current.streams(),
                });
            }
            for (name, chunk) in self.streams.iter().zip(stored.arrays()) {
                writer.append(name, &chunk)?;
            }
            tracing::debug!("Wrote chunk {} to {:?}", self.consumed, self.path);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SinkState::Done) {
            SinkState::Writing { writer, .. } => writer.finish(),
            _ => Ok(()),
        }
    }
}

impl<I, T, R> Iterator for StreamSink<I, T, R>
where
    I: Iterator<Item = Result<R>>,
    T: Element,
    R: Record<T>,
{
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, SinkState::Done) {
            return None;
        }

        match self.source.next() {
            Some(Ok(record)) => {
                if let Err(e) = self.persist(&record) {
                    self.state = SinkState::Done;
                    return Some(Err(e));
                }
                self.consumed += 1;
                Some(Ok(record))
            }
            Some(Err(e)) => {
                self.state = SinkState::Done;
                Some(Err(e))
            }
            None => self.close().err().map(Err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::ok_chunks;
    use crate::store::ContainerReader;
    use ndarray::{array, ArrayD};
    use tempfile::TempDir;

    fn chunks() -> Vec<ArrayD<f64>> {
        vec![
            array![[1.0, 2.0], [3.0, 4.0]].into_dyn(),
            array![[5.0, 6.0], [7.0, 8.0]].into_dyn(),
            array![[9.0, 10.0]].into_dyn(),
        ]
    }

    #[test]
    fn test_sink_forwards_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sink.ckc");

        let mut sink = StreamSink::new(ok_chunks(chunks()), &path);
        let forwarded: Vec<ArrayD<f64>> = sink.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(forwarded, chunks());
        assert_eq!(sink.stream_names(), ["data"]);
        assert_eq!(sink.consumed(), 3);

        let reader = ContainerReader::open(&path).unwrap();
        let array = reader.index().array("data").unwrap();
        assert_eq!(array.shape(), vec![5, 2]);
        assert_eq!(array.meta.chunk_rows, 2);
        assert_eq!(array.meta.expected_rows, DEFAULT_EXPECTED_CHUNKS * 2);
    }

    #[test]
    fn test_skip_persists_every_nth_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skip.ckc");

        let sink = StreamSink::new(ok_chunks(chunks()), &path).skip(2);
        assert_eq!(sink.count(), 3);

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.index().array("data").unwrap().chunks.len(), 2);
        assert_eq!(
            reader.read_chunk::<f64>("data", 1).unwrap(),
            array![[9.0, 10.0]].into_dyn()
        );
    }

    #[test]
    fn test_preprocessor_only_affects_persisted_copy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pre.ckc");

        let sink = StreamSink::new(ok_chunks(chunks()), &path)
            .preprocess(|chunk: &ArrayD<f64>| Ok(chunk.mapv(|v| v * 10.0)));
        let forwarded: Vec<ArrayD<f64>> = sink.collect::<Result<_>>().unwrap();
        assert_eq!(forwarded, chunks());

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(
            reader.read_chunk::<f64>("data", 2).unwrap(),
            array![[90.0, 100.0]].into_dyn()
        );
    }

    #[test]
    fn test_multi_stream_default_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("multi.ckc");

        let records = vec![vec![
            array![1.0, 2.0].into_dyn(),
            array![[1.0], [2.0]].into_dyn(),
        ]];
        let mut sink = StreamSink::new(ok_chunks(records), &path);
        assert_eq!(sink.by_ref().count(), 1);
        assert_eq!(sink.stream_names(), ["data0", "data1"]);
    }

    #[test]
    fn test_single_name_for_multiple_streams_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conflict.ckc");

        let records = vec![vec![array![1.0].into_dyn(), array![2.0].into_dyn()]];
        let mut sink = StreamSink::new(ok_chunks(records), &path)
            .names(StreamNames::Single("x".to_string()));
        assert!(matches!(sink.next(), Some(Err(CacheError::Conflict(_)))));
        assert!(sink.next().is_none());
    }

    #[test]
    fn test_existing_stream_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("existing.ckc");

        let first = StreamSink::new(ok_chunks(chunks()), &path);
        assert_eq!(first.count(), 3);

        let mut second = StreamSink::new(ok_chunks(chunks()), &path);
        assert!(matches!(second.next(), Some(Err(CacheError::Conflict(_)))));

        let mut other = StreamSink::new(ok_chunks(chunks()), &path)
            .names(StreamNames::Single("other".to_string()));
        assert!(other.next().unwrap().is_ok());
    }

    #[test]
    fn test_zero_skip_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut sink = StreamSink::new(ok_chunks(chunks()), dir.path().join("z.ckc")).skip(0);
        assert!(matches!(
            sink.next(),
            Some(Err(CacheError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn test_abandoned_sink_leaves_readable_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.ckc");

        let mut sink = StreamSink::new(ok_chunks(chunks()), &path);
        assert!(sink.next().unwrap().is_ok());
        drop(sink);

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.index().array("data").unwrap().rows, 2);
    }

    #[test]
    fn test_empty_source_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.ckc");

        let sink = StreamSink::<_, f64, ArrayD<f64>>::new(ok_chunks(Vec::new()), &path);
        assert_eq!(sink.count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_explicit_stream_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("named.ckc");

        let records = vec![vec![array![1.0, 2.0].into_dyn(), array![3.0, 4.0].into_dyn()]];
        let mut sink = StreamSink::new(ok_chunks(records), &path).names(StreamNames::Many(vec![
            "left".to_string(),
            "right".to_string(),
        ]));
        assert_eq!(sink.by_ref().count(), 1);
        assert_eq!(sink.stream_names(), ["left", "right"]);

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(
            reader.read_chunk::<f64>("right", 0).unwrap(),
            array![3.0, 4.0].into_dyn()
        );
    }

    #[test]
    fn test_wrong_number_of_stream_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("miscounted.ckc");

        let records = vec![vec![array![1.0].into_dyn(), array![2.0].into_dyn()]];
        let mut sink = StreamSink::new(ok_chunks(records), &path)
            .names(StreamNames::Many(vec!["only".to_string()]));
        assert!(matches!(
            sink.next(),
            Some(Err(CacheError::InvalidArgument(_)))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_leading_empty_chunk_does_not_set_chunk_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leading_empty.ckc");

        let mut records = vec![ArrayD::<f64>::zeros(ndarray::IxDyn(&[0, 2]))];
        records.extend(chunks());
        let sink = StreamSink::new(ok_chunks(records), &path);
        assert_eq!(sink.count(), 4);

        let reader = ContainerReader::open(&path).unwrap();
        let array = reader.index().array("data").unwrap();
        assert_eq!(array.meta.chunk_rows, 2);
        assert_eq!(array.chunks.len(), 3);
        assert_eq!(array.shape(), vec![5, 2]);
    }
}
