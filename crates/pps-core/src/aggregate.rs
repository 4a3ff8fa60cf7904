//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Per-cycle offset samples and their statistical reduction."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::ring::RingBuffer;

/// Mean and population standard deviation of one channel over one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: i32,
    /// Picoseconds; `NaN` when the channel produced no samples.
    pub mean: f64,
    pub stddev: f64,
    pub samples: usize,
}

impl ChannelStats {
    pub fn missing(channel: i32) -> Self {
        Self {
            channel,
            mean: f64::NAN,
            stddev: f64::NAN,
            samples: 0,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.samples == 0
    }
}

/// Reduce raw offset samples to `(mean, population stddev)`.
///
/// Uses an exact two-pass computation; returns `None` for an empty input.
pub fn reduce(samples: impl Iterator<Item = i64> + Clone) -> Option<(f64, f64, usize)> {
    let (count, sum) = samples
        .clone()
        .fold((0usize, 0i128), |(count, sum), sample| {
            (count + 1, sum + i128::from(sample))
        });
    if count == 0 {
        return None;
    }
    let mean = sum as f64 / count as f64;
    let variance = samples
        .map(|sample| {
            let delta = sample as f64 - mean;
            delta * delta
        })
        .sum::<f64>()
        / count as f64;
    Some((mean, variance.sqrt(), count))
}

/// Bounded per-cycle sample store for one channel.
#[derive(Debug, Clone)]
pub struct Histogram {
    samples: RingBuffer<i64>,
    dropped: u64,
}

impl Histogram {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: RingBuffer::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Record one offset; a full store discards its oldest sample.
    pub fn record(&mut self, offset: i64) {
        if self.samples.push_overwrite(offset).is_some() {
            self.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    pub fn stats(&self, channel: i32) -> ChannelStats {
        match reduce(self.samples.iter()) {
            Some((mean, stddev, samples)) => ChannelStats {
                channel,
                mean,
                stddev,
                samples,
            },
            None => ChannelStats::missing(channel),
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::statistics::Statistics;

    #[test]
    fn empty_input_has_no_statistics() {
        assert_eq!(reduce(std::iter::empty()), None);
        let stats = Histogram::new(4).stats(3);
        assert!(stats.is_missing());
        assert!(stats.mean.is_nan() && stats.stddev.is_nan());
    }

    #[test]
    fn single_sample_has_zero_spread() {
        assert_eq!(reduce([42i64].into_iter()), Some((42.0, 0.0, 1)));
    }

    #[test]
    fn matches_population_statistics() {
        let samples = [1_200i64, -350, 980, 15, 4_410, -2_000, 77];
        let (mean, stddev, count) = reduce(samples.iter().copied()).unwrap();
        let floats: Vec<f64> = samples.iter().map(|s| *s as f64).collect();
        assert_eq!(count, samples.len());
        assert!((mean - floats.iter().mean()).abs() < 1e-9);
        assert!((stddev - floats.iter().population_std_dev()).abs() < 1e-9);
    }

    #[test]
    fn large_offsets_keep_precision() {
        let base = 400_000_000_000i64;
        let samples = [base + 3, base - 3, base + 3, base - 3];
        let (mean, stddev, _) = reduce(samples.iter().copied()).unwrap();
        assert_eq!(mean, base as f64);
        assert!((stddev - 3.0).abs() < 1e-6);
    }

    #[test]
    fn full_histogram_discards_oldest() {
        let mut histogram = Histogram::new(2);
        for offset in [100, 10, 20] {
            histogram.record(offset);
        }
        assert_eq!(histogram.take_dropped(), 1);
        assert_eq!(histogram.take_dropped(), 0);
        let stats = histogram.stats(1);
        assert_eq!(stats.mean, 15.0);
        assert_eq!(stats.samples, 2);
        histogram.reset();
        assert!(histogram.is_empty());
    }
}
