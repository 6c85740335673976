use crate::element::Element;
use crate::error::{CacheError, Result};
use ndarray::{ArrayD, Axis, IxDyn, Slice};

/// Regroup a chunk sequence into chunks of exactly `target` rows.
///
/// Holds one output buffer plus the unconsumed tail of the current input
/// chunk. The final chunk may be shorter; an empty input yields nothing.
pub fn rechunk<I, T>(source: I, target: usize) -> Rechunk<I, T>
where
    I: Iterator<Item = Result<ArrayD<T>>>,
    T: Element,
{
    Rechunk::new(source, target)
}

pub struct Rechunk<I, T> {
    source: I,
    target: usize,
    buffer: Option<ArrayD<T>>,
    trailing: Option<Vec<usize>>,
    cursor: usize,
    pending: Option<(ArrayD<T>, usize)>,
    done: bool,
}

impl<I, T> Rechunk<I, T>
where
    I: Iterator<Item = Result<ArrayD<T>>>,
    T: Element,
{
    pub fn new(source: I, target: usize) -> Self {
        Self {
            source,
            target,
            buffer: None,
            trailing: None,
            cursor: 0,
            pending: None,
            done: false,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    fn check_shape(&mut self, chunk: &ArrayD<T>) -> Result<()> {
        if chunk.ndim() == 0 {
            return Err(CacheError::InvalidArgument("cannot rechunk a 0-d chunk".into()));
        }
        let trailing = &chunk.shape()[1..];
        match &self.trailing {
            Some(expected) if expected[..] != *trailing => Err(CacheError::ShapeMismatch {
                expected: expected.clone(),
                actual: trailing.to_vec(),
            }),
            Some(_) => Ok(()),
            None => {
                self.trailing = Some(trailing.to_vec());
                Ok(())
            }
        }
    }

    /// Copy rows of the pending chunk into the buffer; returns a full buffer if any
    fn fill(&mut self, chunk: ArrayD<T>, offset: usize) -> Option<ArrayD<T>> {
        let rows = chunk.len_of(Axis(0));

        if self.cursor == 0 && offset == 0 && rows == self.target {
            return Some(chunk);
        }

        let target = self.target;
        let buffer = self.buffer.get_or_insert_with(|| {
            let mut shape = vec![target];
            shape.extend_from_slice(&chunk.shape()[1..]);
            ArrayD::default(IxDyn(&shape))
        });

        let n = (target - self.cursor).min(rows - offset);
        buffer
            .slice_axis_mut(Axis(0), Slice::from(self.cursor..self.cursor + n))
            .assign(&chunk.slice_axis(Axis(0), Slice::from(offset..offset + n)));
        self.cursor += n;

        if offset + n < rows {
            self.pending = Some((chunk, offset + n));
        }

        if self.cursor == target {
            self.cursor = 0;
            self.buffer.take()
        } else {
            None
        }
    }

    fn flush(&mut self) -> Option<ArrayD<T>> {
        if self.cursor == 0 {
            return None;
        }
        let written = self.cursor;
        self.cursor = 0;
        self.buffer
            .take()
            .map(|buffer| buffer.slice_axis(Axis(0), Slice::from(0..written)).to_owned())
    }
}

impl<I, T> Iterator for Rechunk<I, T>
where
    I: Iterator<Item = Result<ArrayD<T>>>,
    T: Element,
{
    type Item = Result<ArrayD<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.target == 0 && !self.done {
            self.done = true;
            return Some(Err(CacheError::InvalidArgument(
                "rechunk target size must be positive".into(),
            )));
        }

        loop {
            if let Some((chunk, offset)) = self.pending.take() {
                if let Some(full) = self.fill(chunk, offset) {
                    return Some(Ok(full));
                }
                continue;
            }

            if self.done {
                return None;
            }

            match self.source.next() {
                Some(Ok(chunk)) => {
                    if let Err(e) = self.check_shape(&chunk) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    if chunk.len_of(Axis(0)) > 0 {
                        self.pending = Some((chunk, 0));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return self.flush().map(Ok);
                }
            }
        }
    }
}
