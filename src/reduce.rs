//! Reductions and row-wise transforms over chunk sequences.

use crate::chunks::rechunk::{rechunk, Rechunk};
use crate::element::Element;
use crate::error::{CacheError, Result};
use ndarray::{concatenate as concat_rows, ArrayD, ArrayViewD, Axis, IxDyn};
use std::f64::consts::PI;
use std::iter::Peekable;

/// Concatenate every chunk along the row axis into one array
pub fn concatenate<I, T>(sequence: I) -> Result<ArrayD<T>>
where
    I: IntoIterator<Item = Result<ArrayD<T>>>,
    T: Element,
{
    let chunks = sequence.into_iter().collect::<Result<Vec<_>>>()?;
    if chunks.is_empty() {
        return Err(CacheError::EmptySequence);
    }
    let views: Vec<ArrayViewD<'_, T>> = chunks.iter().map(|c| c.view()).collect();
    Ok(concat_rows(Axis(0), &views)?)
}

/// Sum along the row axis
pub fn sum<I>(sequence: I) -> Result<ArrayD<f64>>
where
    I: IntoIterator<Item = Result<ArrayD<f64>>>,
{
    sum_and_rows(sequence).map(|(total, _)| total)
}

/// Mean along the row axis; fails when the sequence has no rows at all
pub fn mean<I>(sequence: I) -> Result<ArrayD<f64>>
where
    I: IntoIterator<Item = Result<ArrayD<f64>>>,
{
    let (total, rows) = sum_and_rows(sequence)?;
    if rows == 0 {
        return Err(CacheError::EmptySequence);
    }
    Ok(total / rows as f64)
}

fn sum_and_rows<I>(sequence: I) -> Result<(ArrayD<f64>, usize)>
where
    I: IntoIterator<Item = Result<ArrayD<f64>>>,
{
    let mut total: Option<ArrayD<f64>> = None;
    let mut rows = 0;
    for chunk in sequence {
        let chunk = chunk?;
        if chunk.ndim() == 0 {
            return Err(CacheError::InvalidArgument("cannot reduce a 0-d chunk".into()));
        }
        rows += chunk.len_of(Axis(0));
        let partial = chunk.sum_axis(Axis(0));
        match total.as_mut() {
            Some(total) if total.shape() != partial.shape() => {
                return Err(CacheError::ShapeMismatch {
                    expected: total.shape().to_vec(),
                    actual: partial.shape().to_vec(),
                })
            }
            Some(total) => *total += &partial,
            None => total = Some(partial),
        }
    }
    total.map(|t| (t, rows)).ok_or(CacheError::EmptySequence)
}

/// Phase-unwrap each column along the rows, continuing across chunk borders
pub fn unwrap<I>(sequence: I) -> Unwrap<I>
where
    I: Iterator<Item = Result<ArrayD<f64>>>,
{
    Unwrap {
        source: sequence,
        last: Vec::new(),
    }
}

pub struct Unwrap<I> {
    source: I,
    /// `(raw, unwrapped)` of the previous row, per column
    last: Vec<(f64, f64)>,
}

impl<I> Unwrap<I> {
    fn unwrap_chunk(&mut self, chunk: ArrayD<f64>) -> Result<ArrayD<f64>> {
        if chunk.ndim() == 0 {
            return Err(CacheError::InvalidArgument("cannot unwrap a 0-d chunk".into()));
        }
        let shape = chunk.shape().to_vec();
        let columns: usize = shape[1..].iter().product();
        if shape[0] == 0 || columns == 0 {
            return Ok(chunk);
        }
        let mut data: Vec<f64> = chunk.as_standard_layout().iter().copied().collect();
        if self.last.is_empty() {
            self.last = data[..columns].iter().map(|&x| (x, x)).collect();
        } else if self.last.len() != columns {
            return Err(CacheError::ShapeMismatch {
                expected: vec![self.last.len()],
                actual: vec![columns],
            });
        }

        for row in data.chunks_exact_mut(columns) {
            for (value, (raw, unwrapped)) in row.iter_mut().zip(self.last.iter_mut()) {
                let delta = *value - *raw;
                *raw = *value;
                *unwrapped += wrap_step(delta);
                *value = *unwrapped;
            }
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
    }
}

/// Steps of at least pi are taken modulo 2 pi into `[-pi, pi]`
fn wrap_step(delta: f64) -> f64 {
    if delta.abs() < PI {
        return delta;
    }
    let wrapped = (delta + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI && delta > 0.0 {
        PI
    } else {
        wrapped
    }
}

impl<I> Iterator for Unwrap<I>
where
    I: Iterator<Item = Result<ArrayD<f64>>>,
{
    type Item = Result<ArrayD<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.source.next()?;
        Some(chunk.and_then(|chunk| self.unwrap_chunk(chunk)))
    }
}

/// NaN-ignoring mean of every `batch` consecutive rows, regrouped into chunks
/// of `chunk_size` rows.
///
/// Without `chunk_size` the row count of the first input chunk is used. Rows
/// that do not fill a final batch are dropped when `allow_remainder` is set,
/// and reported as [`CacheError::RemainderLeftOver`] otherwise.
pub fn batch_mean<I>(
    sequence: I,
    batch: usize,
    chunk_size: Option<usize>,
    allow_remainder: bool,
) -> Result<Rechunk<BatchMean<Peekable<I>>, f64>>
where
    I: Iterator<Item = Result<ArrayD<f64>>>,
{
    if batch == 0 {
        return Err(CacheError::InvalidArgument("batch size must be positive".into()));
    }
    let mut sequence = sequence.peekable();
    let chunk_size = match chunk_size {
        Some(size) => size,
        None => match sequence.peek() {
            Some(Ok(first)) if first.ndim() > 0 => first.len_of(Axis(0)).max(1),
            _ => 1,
        },
    };
    let averaged = BatchMean {
        source: sequence,
        batch,
        allow_remainder,
        rest: None,
        done: false,
    };
    Ok(rechunk(averaged, chunk_size))
}

pub struct BatchMean<I> {
    source: I,
    batch: usize,
    allow_remainder: bool,
    rest: Option<ArrayD<f64>>,
    done: bool,
}

impl<I> BatchMean<I> {
    fn average(&mut self, chunk: ArrayD<f64>) -> Result<Option<ArrayD<f64>>> {
        if chunk.ndim() == 0 {
            return Err(CacheError::InvalidArgument("cannot batch a 0-d chunk".into()));
        }
        let data = match self.rest.take() {
            Some(rest) => concat_rows(Axis(0), &[rest.view(), chunk.view()])?,
            None => chunk,
        };
        let rows = data.len_of(Axis(0));
        let batches = rows / self.batch;
        let used = batches * self.batch;
        if used < rows {
            self.rest = Some(
                data.slice_axis(Axis(0), ndarray::Slice::from(used..))
                    .to_owned(),
            );
        }
        if batches == 0 {
            return Ok(None);
        }

        let trailing = data.shape()[1..].to_vec();
        let columns: usize = trailing.iter().product();
        let flat: Vec<f64> = data
            .slice_axis(Axis(0), ndarray::Slice::from(..used))
            .as_standard_layout()
            .iter()
            .copied()
            .collect();

        let mut out = vec![0.0; batches * columns];
        for (b, group) in flat.chunks_exact(self.batch * columns.max(1)).enumerate() {
            for c in 0..columns {
                let (total, count) = (0..self.batch)
                    .map(|r| group[r * columns + c])
                    .filter(|v| !v.is_nan())
                    .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                out[b * columns + c] = if count == 0 { f64::NAN } else { total / count as f64 };
            }
        }

        let mut shape = vec![batches];
        shape.extend(trailing);
        Ok(Some(ArrayD::from_shape_vec(IxDyn(&shape), out)?))
    }
}

impl<I> Iterator for BatchMean<I>
where
    I: Iterator<Item = Result<ArrayD<f64>>>,
{
    type Item = Result<ArrayD<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.source.next() {
                Some(Ok(chunk)) => match self.average(chunk) {
                    Ok(Some(averaged)) => return Some(Ok(averaged)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    let left = self.rest.take().map_or(0, |r| r.len_of(Axis(0)));
                    if left > 0 && !self.allow_remainder {
                        return Some(Err(CacheError::RemainderLeftOver { rows: left }));
                    }
                }
            }
        }
        None
    }
}
