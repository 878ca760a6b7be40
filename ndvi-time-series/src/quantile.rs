use anyhow::{bail, Result};
use log::debug;
use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::ndvi::NdviSeries;

/// Row order inside [`QuantileSummary::values`]
pub const LOWER: usize = 0;
pub const MEDIAN: usize = 1;
pub const UPPER: usize = 2;

/// Per time step lower/median/upper quantiles over batch and space.
pub struct QuantileSummary {
    pub levels: [f64; 3],
    /// shape (3, T); NaN on invalid steps
    pub values: Array2<f32>,
    /// Observed pixels per time step
    pub counts: Vec<usize>,
    pub valid: Vec<bool>,
}

impl QuantileSummary {
    pub fn time_steps(&self) -> usize {
        self.valid.len()
    }

    pub fn valid_steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter(|&(_, &ok)| ok)
            .map(|(t, _)| t)
    }

    pub fn at(&self, t: usize) -> [f32; 3] {
        [
            self.values[(LOWER, t)],
            self.values[(MEDIAN, t)],
            self.values[(UPPER, t)],
        ]
    }
}

/// `[(1 - c) / 2, 0.5, 1 - (1 - c) / 2]`
pub fn quantile_levels(confidence: f64) -> Result<[f64; 3]> {
    if !(0.0..=1.0).contains(&confidence) {
        bail!("confidence must be within [0, 1], got {}", confidence);
    }
    let tail = (1.0 - confidence) / 2.0;
    Ok([tail, 0.5, 1.0 - tail])
}

/// Linear interpolation between order statistics of an ascending slice.
pub fn percentile_linear(sorted: &[f32], q: f64) -> f32 {
    let n = sorted.len();
    if n == 0 {
        return f32::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let pos = (n as f64 - 1.0) * q;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let t = pos - lo as f64;
    (sorted[lo] as f64 * (1.0 - t) + sorted[hi] as f64 * t) as f32
}

/// Summarise an NDVI series per time step over observed pixels only.
///
/// Cloud-masked pixels are left out of the quantiles rather than counted as zero NDVI,
/// so a partly cloudy step reports the median of its clear pixels. Steps with fewer
/// than `min_valid_pixels` observed pixels (at least one) are invalid.
pub fn summarize(
    series: &NdviSeries,
    confidence: f64,
    min_valid_pixels: usize,
) -> Result<QuantileSummary> {
    let levels = quantile_levels(confidence)?;
    let min_valid = min_valid_pixels.max(1);
    let n_t = series.time_steps();

    let per_step: Vec<(usize, Option<[f32; 3]>)> = (0..n_t)
        .into_par_iter()
        .map(|t| {
            let values = series.values.index_axis(Axis(3), t);
            let observed = series.observed.index_axis(Axis(3), t);
            let mut picked: Vec<f32> = values
                .iter()
                .zip(observed.iter())
                .filter(|&(_, &ok)| ok)
                .map(|(&v, _)| v)
                .collect();
            let count = picked.len();
            if count < min_valid {
                return (count, None);
            }
            picked.sort_unstable_by(|a, b| a.total_cmp(b));
            let q = levels.map(|level| percentile_linear(&picked, level));
            (count, Some(q))
        })
        .collect();

    let mut values = Array2::<f32>::from_elem((3, n_t), f32::NAN);
    let mut counts = Vec::with_capacity(n_t);
    let mut valid = Vec::with_capacity(n_t);
    for (t, (count, q)) in per_step.into_iter().enumerate() {
        counts.push(count);
        valid.push(q.is_some());
        match q {
            Some(q) => {
                for (row, v) in q.into_iter().enumerate() {
                    values[(row, t)] = v;
                }
            }
            None => debug!("time step {} has {} observed pixels, below {}", t, count, min_valid),
        }
    }

    Ok(QuantileSummary {
        levels,
        values,
        counts,
        valid,
    })
}
