//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Sliding-window linear clock fit over external clock ticks."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Incremental least-squares fit of external clock ticks.
//!
//! Each raw tick `t_j` is expressed as its deviation from an ideal lattice
//! ending at the newest tick: `e_j = t_j - (t_newest - age_j * period)`,
//! where `age_j` is zero for the newest tick. The fitter keeps three running
//! sums over the window (`sum e`, `-sum age * e` and `sum 1..=m`) and updates
//! them in O(1) per tick, both while the window fills and once it slides.
//! The fitted value of the newest tick is the intercept of the regression of
//! `e` against age, evaluated at age zero.

use std::fmt;

use tracing::{debug, trace};

use crate::ring::RingBuffer;

/// Anchors retained for mapping; two define the active interval.
const ANCHOR_HISTORY: usize = 3;

/// One fitted clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FittedAnchor {
    /// Raw tagger timestamp of the tick.
    pub raw: i64,
    /// Least-squares estimate of the tick on the tagger timebase.
    pub fitted: i64,
    /// Ideal time of the tick on the external clock lattice.
    pub nominal: i64,
}

/// Whether the tick window is still growing or already sliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    Filling,
    Full,
}

/// The two newest anchors, used to map raw times onto the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorInterval {
    pub start: FittedAnchor,
    pub end: FittedAnchor,
    pub period: i64,
}

impl AnchorInterval {
    pub fn cycle_length(&self) -> i64 {
        self.end.fitted - self.start.fitted
    }

    /// Linearly map a raw tagger time onto the clock lattice.
    ///
    /// Returns `None` when the fitted interval is not positive or the mapped
    /// value leaves the `i64` range.
    pub fn map(&self, raw: i64) -> Option<i64> {
        let length = self.cycle_length();
        if length <= 0 {
            return None;
        }
        let scaled =
            i128::from(self.period) * i128::from(raw - self.start.fitted) / i128::from(length);
        let scaled = i64::try_from(scaled).ok()?;
        self.start.nominal.checked_add(scaled)
    }
}

/// Running linear regression over the newest `window` clock ticks.
#[derive(Clone)]
pub struct ClockFitter {
    period: i64,
    ticks: RingBuffer<i64>,
    deviation_sum: i64,
    weighted_sum: i64,
    index_sum: i64,
    last_tick: Option<i64>,
    nominal: i64,
    anchors: RingBuffer<FittedAnchor>,
}

impl fmt::Debug for ClockFitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockFitter")
            .field("period", &self.period)
            .field("window", &self.ticks.capacity())
            .field("ticks", &self.ticks.len())
            .field("nominal", &self.nominal)
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

impl ClockFitter {
    /// `period` is the nominal tick spacing in picoseconds; `window` is the
    /// fit length and must be at least 2.
    pub fn new(period: i64, window: usize) -> Self {
        Self {
            period,
            ticks: RingBuffer::with_capacity(window.max(2)),
            deviation_sum: 0,
            weighted_sum: 0,
            index_sum: 0,
            last_tick: None,
            nominal: -period,
            anchors: RingBuffer::with_capacity(ANCHOR_HISTORY),
        }
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    pub fn window(&self) -> usize {
        self.ticks.capacity()
    }

    /// Ticks currently inside the fit window.
    pub fn window_len(&self) -> usize {
        self.ticks.len()
    }

    pub fn mode(&self) -> WindowMode {
        if self.ticks.is_full() {
            WindowMode::Full
        } else {
            WindowMode::Filling
        }
    }

    /// Nominal time of the most recent tick.
    pub fn nominal_time(&self) -> i64 {
        self.nominal
    }

    /// Offset to add to the newest raw tick to obtain its fitted value.
    pub fn fitted_offset(&self) -> i64 {
        let m = self.ticks.len() as i128;
        if m < 2 || self.index_sum == 0 {
            return 0;
        }
        let numerator =
            (2 * m - 1) * i128::from(self.deviation_sum) + 3 * i128::from(self.weighted_sum);
        (numerator / i128::from(self.index_sum)) as i64
    }

    /// Fold a raw clock tick into the window and return its fitted anchor.
    pub fn on_tick(&mut self, raw: i64) -> FittedAnchor {
        let step = match self.last_tick {
            Some(last) => raw - last - self.period,
            None => 0,
        };

        match (self.mode(), self.ticks.front()) {
            (WindowMode::Full, Some(evicted)) => {
                let n = self.ticks.capacity() as i64;
                let front_to_end = raw - evicted - n * self.period;
                self.weighted_sum += -self.deviation_sum + step * self.index_sum - front_to_end * n;
                self.deviation_sum += front_to_end - n * step;
            }
            _ => {
                let previous = self.ticks.len() as i64;
                self.weighted_sum += -self.deviation_sum + step * self.index_sum;
                self.deviation_sum -= previous * step;
                self.index_sum += previous + 1;
            }
        }

        self.ticks.push_overwrite(raw);
        self.last_tick = Some(raw);
        self.nominal += self.period;

        let anchor = FittedAnchor {
            raw,
            fitted: raw + self.fitted_offset(),
            nominal: self.nominal,
        };
        self.anchors.push_overwrite(anchor);
        trace!(raw, fitted = anchor.fitted, nominal = anchor.nominal, "clock tick fitted");
        anchor
    }

    /// Account for `skipped` ticks lost in a clock overflow and restart the fit.
    pub fn on_overflow(&mut self, skipped: u32) {
        self.nominal += i64::from(skipped) * self.period;
        self.ticks.clear();
        self.anchors.clear();
        self.deviation_sum = 0;
        self.weighted_sum = 0;
        self.index_sum = 0;
        self.last_tick = None;
        debug!(skipped, nominal = self.nominal, "clock fit reset after overflow");
    }

    pub fn latest_anchor(&self) -> Option<FittedAnchor> {
        self.anchors.back()
    }

    /// Interval between the two newest anchors, once two exist.
    pub fn interval(&self) -> Option<AnchorInterval> {
        Some(AnchorInterval {
            start: self.anchors.newest(1)?,
            end: self.anchors.newest(0)?,
            period: self.period,
        })
    }

    /// Map a raw time using the newest fitted interval.
    pub fn map(&self, raw: i64) -> Option<i64> {
        self.interval()?.map(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PERIOD: i64 = 100_000;

    /// Batch least-squares fit of the window, evaluated at the newest tick.
    fn batch_fit(window: &[i64]) -> f64 {
        let base = window[0];
        let m = window.len() as f64;
        let xs: Vec<f64> = (0..window.len()).map(|j| j as f64).collect();
        let ys: Vec<f64> = window.iter().map(|t| (t - base) as f64).collect();
        let x_mean = xs.iter().sum::<f64>() / m;
        let y_mean = ys.iter().sum::<f64>() / m;
        let sxy: f64 = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| (x - x_mean) * (y - y_mean))
            .sum();
        let sxx: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
        let slope = sxy / sxx;
        base as f64 + y_mean + slope * ((m - 1.0) - x_mean)
    }

    #[test]
    fn ideal_ticks_fit_to_themselves() {
        let mut fitter = ClockFitter::new(PERIOD, 8);
        for k in 0..20 {
            let raw = 5_000 + k * PERIOD;
            let anchor = fitter.on_tick(raw);
            assert_eq!(anchor.fitted, raw);
            assert_eq!(anchor.nominal, k * PERIOD);
        }
        assert_eq!(fitter.mode(), WindowMode::Full);
    }

    #[test]
    fn first_tick_has_nominal_zero_and_no_interval() {
        let mut fitter = ClockFitter::new(PERIOD, 4);
        let anchor = fitter.on_tick(123);
        assert_eq!(anchor.nominal, 0);
        assert_eq!(anchor.fitted, 123);
        assert!(fitter.interval().is_none());
        assert!(fitter.map(200).is_none());
    }

    #[test]
    fn fit_absorbs_a_single_outlier() {
        let mut fitter = ClockFitter::new(PERIOD, 10);
        let mut last = FittedAnchor::default();
        for k in 0..10 {
            let jitter = if k == 9 { 1_000 } else { 0 };
            last = fitter.on_tick(k * PERIOD + jitter);
        }
        assert!(last.fitted < last.raw);
        assert!(last.fitted > 9 * PERIOD);
    }

    #[test]
    fn map_interpolates_between_anchors() {
        let mut fitter = ClockFitter::new(PERIOD, 4);
        // Tagger runs 1% slow relative to the clock lattice.
        for k in 0..4 {
            fitter.on_tick(k * 99_000);
        }
        let interval = fitter.interval().unwrap();
        assert_eq!(interval.cycle_length(), 99_000);
        assert_eq!(fitter.map(2 * 99_000 + 49_500), Some(2 * PERIOD + PERIOD / 2));
        assert_eq!(fitter.map(3 * 99_000), Some(3 * PERIOD));
    }

    #[test]
    fn overflow_advances_nominal_time_and_resets() {
        let mut fitter = ClockFitter::new(PERIOD, 4);
        for k in 0..5 {
            fitter.on_tick(k * PERIOD);
        }
        assert_eq!(fitter.nominal_time(), 4 * PERIOD);
        fitter.on_overflow(10);
        assert_eq!(fitter.nominal_time(), 14 * PERIOD);
        assert_eq!(fitter.window_len(), 0);
        assert!(fitter.interval().is_none());

        let anchor = fitter.on_tick(15 * PERIOD + 7);
        assert_eq!(anchor.nominal, 15 * PERIOD);
        assert_eq!(anchor.fitted, 15 * PERIOD + 7);
        assert_eq!(fitter.mode(), WindowMode::Filling);
    }

    #[test]
    fn degenerate_interval_does_not_map() {
        let interval = AnchorInterval {
            start: FittedAnchor {
                raw: 10,
                fitted: 10,
                nominal: 0,
            },
            end: FittedAnchor {
                raw: 10,
                fitted: 10,
                nominal: PERIOD,
            },
            period: PERIOD,
        };
        assert_eq!(interval.map(15), None);
    }

    proptest! {
        #[test]
        fn incremental_fit_matches_batch_fit(
            window in 2usize..40,
            jitter in prop::collection::vec(-5_000i64..5_000, 2..160),
        ) {
            let mut fitter = ClockFitter::new(PERIOD, window);
            let raws: Vec<i64> = jitter
                .iter()
                .enumerate()
                .map(|(k, j)| 1_000_000 + k as i64 * PERIOD + j)
                .collect();
            for (k, raw) in raws.iter().enumerate() {
                let anchor = fitter.on_tick(*raw);
                let start = (k + 1).saturating_sub(window);
                let slice = &raws[start..=k];
                if slice.len() >= 2 {
                    let expected = batch_fit(slice);
                    prop_assert!(
                        (anchor.fitted as f64 - expected).abs() <= 1.0,
                        "tick {} fitted {} expected {}", k, anchor.fitted, expected
                    );
                } else {
                    prop_assert_eq!(anchor.fitted, *raw);
                }
            }
        }
    }
}
