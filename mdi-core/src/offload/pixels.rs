//! CPU-bound pixel transforms.
//!
//! Each transform is a plain function over `f64` samples so it can run
//! inline or on the offload thread. [`PixelBuffer::values`] feeds them
//! without copying the buffer.
//!
//! [`PixelBuffer::values`]: crate::protocol::PixelBuffer::values

use serde::{Deserialize, Serialize};

/// Default number of histogram bins.
pub const DEFAULT_BINS: usize = 256;

// ── Window / level ───────────────────────────────────────────────

/// Linear remap of `[center - width/2, center + width/2]` onto
/// `[output_min, output_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
    pub output_min: u8,
    pub output_max: u8,
}

impl WindowLevel {
    pub fn new(center: f64, width: f64) -> Self {
        Self {
            center,
            width,
            output_min: 0,
            output_max: u8::MAX,
        }
    }

    pub fn with_output(mut self, min: u8, max: u8) -> Self {
        self.output_min = min.min(max);
        self.output_max = max.max(min);
        self
    }

    pub fn window_min(&self) -> f64 {
        self.center - self.width / 2.0
    }

    pub fn window_max(&self) -> f64 {
        self.center + self.width / 2.0
    }

    /// Map one sample. NaN maps to `output_min`.
    pub fn apply(&self, value: f64) -> u8 {
        let lo = self.window_min();
        let hi = self.window_max();
        if value.is_nan() || value <= lo {
            return self.output_min;
        }
        if value >= hi {
            return self.output_max;
        }
        // Here lo < value < hi, so width > 0.
        let out_min = f64::from(self.output_min);
        let out_max = f64::from(self.output_max);
        let scaled = (value - lo) * (out_max - out_min) / self.width + out_min;
        scaled.round().clamp(out_min, out_max) as u8
    }
}

pub fn window_level<I>(values: I, params: &WindowLevel) -> Vec<u8>
where
    I: IntoIterator<Item = f64>,
{
    values.into_iter().map(|v| params.apply(v)).collect()
}

// ── Min / max ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    pub const EMPTY: MinMax = MinMax {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// Single linear scan. Empty input yields `(+inf, -inf)`; NaN samples are
/// skipped.
pub fn min_max<I>(values: I) -> MinMax
where
    I: IntoIterator<Item = f64>,
{
    values.into_iter().fold(MinMax::EMPTY, |acc, v| MinMax {
        min: if v < acc.min { v } else { acc.min },
        max: if v > acc.max { v } else { acc.max },
    })
}

// ── Histogram ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bins: Vec<u64>,
    pub min: f64,
    pub max: f64,
    pub bin_size: f64,
}

impl Histogram {
    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }
}

/// Two passes: range first, then bucketing by
/// `floor((v - min) / bin_size)` clamped to the last bin.
///
/// When every sample is equal all of them land in bin 0. `bin_count` of
/// zero is treated as one.
pub fn histogram<I>(values: I, bin_count: usize) -> Histogram
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let range = min_max(iter.clone());
    let bin_count = bin_count.max(1);
    let mut bins = vec![0u64; bin_count];
    let last = bin_count - 1;

    let span = range.max - range.min;
    let bin_size = if range.is_empty() {
        0.0
    } else {
        span / bin_count as f64
    };

    for v in iter {
        let index = if bin_size > 0.0 {
            // NaN casts to 0.
            (((v - range.min) / bin_size).floor() as usize).min(last)
        } else {
            0
        };
        bins[index] += 1;
    }

    Histogram {
        bins,
        min: range.min,
        max: range.max,
        bin_size,
    }
}
