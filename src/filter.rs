//! Second-order-section IIR filtering over chunk sequences, and zero-phase
//! filtering built from two cached causal passes.

use crate::cache::{ChunkCache, Stage};
use crate::chunks::source::ChunkSource;
use crate::error::{CacheError, Result};
use crate::fingerprint::{fingerprint, Identifier};
use ndarray::{ArrayD, IxDyn};
use std::f64::consts::{PI, SQRT_2};

/// Stage name under which both zero-phase passes are cached
pub const ZERO_PHASE_STAGE: &str = "sosfiltfilt";

/// Cascade of biquads, each `[b0, b1, b2, a0, a1, a2]` with `a0` normalised to 1
#[derive(Debug, Clone, PartialEq)]
pub struct Sos {
    sections: Vec<[f64; 6]>,
}

impl Sos {
    pub fn new(sections: Vec<[f64; 6]>) -> Result<Self> {
        if sections.is_empty() {
            return Err(CacheError::InvalidArgument(
                "filter needs at least one section".into(),
            ));
        }
        let mut normalized = Vec::with_capacity(sections.len());
        for section in sections {
            let a0 = section[3];
            if a0 == 0.0 || !a0.is_finite() {
                return Err(CacheError::InvalidArgument(format!(
                    "section {:?} has invalid a0",
                    section
                )));
            }
            normalized.push(section.map(|c| c / a0));
        }
        Ok(Self {
            sections: normalized,
        })
    }

    /// Second-order Butterworth low-pass; `cutoff` is relative to Nyquist
    pub fn butter2_lowpass(cutoff: f64) -> Result<Self> {
        if !(cutoff > 0.0 && cutoff < 1.0) {
            return Err(CacheError::InvalidArgument(format!(
                "cutoff {cutoff} outside (0, 1)"
            )));
        }
        let k = (PI * cutoff / 2.0).tan();
        let norm = 1.0 / (1.0 + SQRT_2 * k + k * k);
        let b0 = k * k * norm;
        Self::new(vec![[
            b0,
            2.0 * b0,
            b0,
            1.0,
            2.0 * (k * k - 1.0) * norm,
            (1.0 - SQRT_2 * k + k * k) * norm,
        ]])
    }

    pub fn sections(&self) -> &[[f64; 6]] {
        &self.sections
    }

    /// Identifier of the coefficients, for cache keys
    pub fn fingerprint(&self) -> Identifier {
        fingerprint(self.sections.iter().map(|section| {
            section
                .iter()
                .flat_map(|c| c.to_le_bytes())
                .collect::<Vec<u8>>()
        }))
    }

    /// Gain for a constant input
    pub fn dc_gain(&self) -> f64 {
        self.sections.iter().map(section_gain).product()
    }

    /// Per-section `[z0, z1]` once a unit constant input has settled
    fn steady_state(&self) -> Vec<[f64; 2]> {
        let mut level = 1.0;
        self.sections
            .iter()
            .map(|section| {
                let [_, b1, b2, _, a1, a2] = *section;
                let gain = section_gain(section);
                let z1 = (b2 - a2 * gain) * level;
                let z0 = (b1 - a1 * gain) * level + z1;
                level *= gain;
                [z0, z1]
            })
            .collect()
    }

    /// Causal filter over `source`, starting from the steady state of its first row
    pub fn filter<I>(&self, source: I) -> SosFilt<I>
    where
        I: Iterator<Item = Result<ArrayD<f64>>>,
    {
        self.filter_with(source, FilterInit::SteadyState)
    }

    pub fn filter_with<I>(&self, source: I, init: FilterInit) -> SosFilt<I>
    where
        I: Iterator<Item = Result<ArrayD<f64>>>,
    {
        SosFilt {
            source,
            sos: self.clone(),
            init,
            state: Vec::new(),
            trailing: None,
        }
    }
}

fn section_gain(section: &[f64; 6]) -> f64 {
    let [b0, b1, b2, _, a1, a2] = *section;
    let denominator = 1.0 + a1 + a2;
    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        (b0 + b1 + b2) / denominator
    }
}

/// Initial filter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterInit {
    /// Start from rest
    Zero,
    /// Start as if the first row had been applied forever, avoiding a transient
    #[default]
    SteadyState,
}

/// Direct form II transposed filter along the row axis, with state carried
/// across chunk boundaries so chunking never changes the output.
pub struct SosFilt<I> {
    source: I,
    sos: Sos,
    init: FilterInit,
    /// `[z0, z1]` per section per column, empty until the first row arrives
    state: Vec<[f64; 2]>,
    trailing: Option<Vec<usize>>,
}

impl<I> SosFilt<I> {
    pub fn sos(&self) -> &Sos {
        &self.sos
    }

    fn initialize(&mut self, first_row: &[f64]) {
        let columns = first_row.len();
        self.state = vec![[0.0; 2]; self.sos.sections.len() * columns];
        if self.init == FilterInit::Zero {
            return;
        }
        let unit = self.sos.steady_state();
        for (s, zi) in unit.iter().enumerate() {
            for (c, &x) in first_row.iter().enumerate() {
                self.state[s * columns + c] = [zi[0] * x, zi[1] * x];
            }
        }
    }

    fn filter_chunk(&mut self, chunk: ArrayD<f64>) -> Result<ArrayD<f64>> {
        if chunk.ndim() == 0 {
            return Err(CacheError::InvalidArgument(
                "cannot filter a zero-dimensional chunk".into(),
            ));
        }
        let shape = chunk.shape().to_vec();
        let trailing = shape[1..].to_vec();
        match &self.trailing {
            Some(expected) if *expected != trailing => {
                return Err(CacheError::ShapeMismatch {
                    expected: expected.clone(),
                    actual: trailing,
                })
            }
            Some(_) => {}
            None => self.trailing = Some(trailing.clone()),
        }

        let rows = shape[0];
        if rows == 0 {
            return Ok(chunk);
        }
        let columns: usize = trailing.iter().product();
        if columns == 0 {
            return Ok(chunk);
        }
        let mut data: Vec<f64> = chunk.as_standard_layout().iter().copied().collect();
        if self.state.is_empty() {
            self.initialize(&data[..columns]);
        }

        for row in data.chunks_exact_mut(columns) {
            for (c, value) in row.iter_mut().enumerate() {
                let mut x = *value;
                for (s, section) in self.sos.sections.iter().enumerate() {
                    let [b0, b1, b2, _, a1, a2] = *section;
                    let z = &mut self.state[s * columns + c];
                    let y = b0 * x + z[0];
                    z[0] = b1 * x - a1 * y + z[1];
                    z[1] = b2 * x - a2 * y;
                    x = y;
                }
                *value = x;
            }
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
    }
}

impl<I> Iterator for SosFilt<I>
where
    I: Iterator<Item = Result<ArrayD<f64>>>,
{
    type Item = Result<ArrayD<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.source.next()?;
        Some(chunk.and_then(|chunk| self.filter_chunk(chunk)))
    }
}

/// Zero-phase filtering of `sequence` in two cached passes.
///
/// The forward pass is persisted, read back reversed and filtered again; the
/// second pass is persisted and returned reversed. Both entries are keyed by
/// `identifier` and the filter coefficients. Without an identifier a random
/// one is used, so nothing is ever reused.
#[track_caller]
pub fn zero_phase_filter<I>(
    cache: &ChunkCache,
    sos: &Sos,
    sequence: I,
    identifier: Option<Identifier>,
) -> Result<ChunkSource<f64>>
where
    I: Iterator<Item = Result<ArrayD<f64>>>,
{
    let identifier = identifier.unwrap_or_else(|| {
        tracing::warn!("Zero-phase filter input has no identifier, results will not be reused");
        Identifier::random()
    });
    let coefficients = sos.fingerprint();
    let stage = |version: &str| {
        Stage::new(ZERO_PHASE_STAGE)
            .with_version(version)
            .with_input(&identifier)
            .with_input(&coefficients)
    };

    let forward: ChunkSource<f64> = cache.materialize(sos.filter(sequence), &stage("filt1"))?;
    let backward: ChunkSource<f64> =
        cache.materialize(sos.filter(forward.reversed().iter()), &stage("filt2"))?;
    Ok(backward.reversed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array2};

    fn ramp(rows: usize) -> ArrayD<f64> {
        Array::from_iter((0..rows).map(|r| (r as f64 * 0.37).sin())).into_dyn()
    }

    #[test]
    fn test_butterworth_unit_dc_gain() {
        let sos = Sos::butter2_lowpass(0.2).unwrap();
        assert!((sos.dc_gain() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_coefficients() {
        assert!(Sos::new(vec![]).is_err());
        assert!(Sos::new(vec![[1.0, 0.0, 0.0, 0.0, 0.0, 0.0]]).is_err());
        assert!(Sos::butter2_lowpass(1.0).is_err());
        assert!(Sos::butter2_lowpass(0.0).is_err());
    }

    #[test]
    fn test_sections_normalised() {
        let sos = Sos::new(vec![[2.0, 0.0, 0.0, 2.0, 1.0, 0.0]]).unwrap();
        assert_eq!(sos.sections()[0], [1.0, 0.0, 0.0, 1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_steady_state_constant_is_unchanged() {
        let sos = Sos::butter2_lowpass(0.1).unwrap();
        let constant = Array2::from_elem((50, 3), 4.0).into_dyn();
        let out = sos
            .filter(std::iter::once(Ok(constant)))
            .next()
            .unwrap()
            .unwrap();
        for value in out.iter() {
            assert!((value - 4.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let sos = Sos::butter2_lowpass(0.3).unwrap();
        let whole = sos
            .filter(std::iter::once(Ok(ramp(90))))
            .next()
            .unwrap()
            .unwrap();

        let pieces = (0..3).map(|i| {
            let full = ramp(90);
            Ok(full
                .slice_axis(ndarray::Axis(0), ndarray::Slice::from(i * 30..(i + 1) * 30))
                .to_owned())
        });
        let chunked: Vec<f64> = sos
            .filter_with(pieces, FilterInit::SteadyState)
            .flat_map(|c| c.unwrap().into_iter())
            .collect();
        let expected: Vec<f64> = whole.iter().copied().collect();
        assert_eq!(chunked, expected);
    }

    #[test]
    fn test_zero_init_starts_from_rest() {
        let sos = Sos::butter2_lowpass(0.1).unwrap();
        let out = sos
            .filter_with(
                std::iter::once(Ok(Array::from_elem(1, 1.0).into_dyn())),
                FilterInit::Zero,
            )
            .next()
            .unwrap()
            .unwrap();
        assert!((out[[0]] - sos.sections()[0][0]).abs() < 1e-15);
    }

    #[test]
    fn test_trailing_shape_change_rejected() {
        let sos = Sos::butter2_lowpass(0.1).unwrap();
        let chunks = vec![
            Ok(Array2::<f64>::zeros((2, 3)).into_dyn()),
            Ok(Array2::<f64>::zeros((2, 4)).into_dyn()),
        ];
        let results: Vec<_> = sos.filter(chunks.into_iter()).collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CacheError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_fingerprint_depends_on_coefficients() {
        let a = Sos::butter2_lowpass(0.1).unwrap();
        let b = Sos::butter2_lowpass(0.2).unwrap();
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
