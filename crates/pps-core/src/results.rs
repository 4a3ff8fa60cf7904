//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Circular store of completed cycle statistics shared with readers."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Completed-cycle results.
//!
//! The correlator is the only writer. Readers take [`ResultSnapshot`]s
//! through [`SharedResults`]; a snapshot always contains whole rows because
//! a row is committed under a single write lock.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::aggregate::ChannelStats;

/// One completed cycle as handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRow {
    pub cycle_index: u64,
    /// Time of the reference tag that closed the cycle, in picoseconds.
    pub reference_time: i64,
    pub channels: Vec<ChannelStats>,
}

#[derive(Debug, Clone)]
pub struct ResultBuffer {
    channels: Vec<i32>,
    capacity: usize,
    mean: Vec<Vec<f64>>,
    stddev: Vec<Vec<f64>>,
    samples: Vec<Vec<usize>>,
    reference_time: Vec<i64>,
    write_index: usize,
    filled: usize,
    completed_cycles: u64,
}

impl ResultBuffer {
    pub fn new(channels: Vec<i32>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let columns = channels.len();
        Self {
            channels,
            capacity,
            mean: vec![vec![f64::NAN; capacity]; columns],
            stddev: vec![vec![f64::NAN; capacity]; columns],
            samples: vec![vec![0; capacity]; columns],
            reference_time: vec![0; capacity],
            write_index: 0,
            filled: 0,
            completed_cycles: 0,
        }
    }

    pub fn channels(&self) -> &[i32] {
        &self.channels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Store one cycle and return its index. `row` holds one entry per
    /// channel, in channel registration order.
    pub(crate) fn commit(&mut self, reference_time: i64, row: &[ChannelStats]) -> u64 {
        let slot = self.write_index;
        for (column, stats) in row.iter().enumerate().take(self.channels.len()) {
            self.mean[column][slot] = stats.mean;
            self.stddev[column][slot] = stats.stddev;
            self.samples[column][slot] = stats.samples;
        }
        self.reference_time[slot] = reference_time;
        self.write_index = (slot + 1) % self.capacity;
        self.filled = (self.filled + 1).min(self.capacity);
        let index = self.completed_cycles;
        self.completed_cycles += 1;
        index
    }

    /// Store `cycles` copies of `row`. Only the newest `capacity` are written;
    /// older ones just advance `completed_cycles`. Returns the stored indices.
    pub(crate) fn commit_repeated(
        &mut self,
        reference_time: i64,
        row: &[ChannelStats],
        cycles: u64,
    ) -> Range<u64> {
        let capacity = self.capacity as u64;
        self.completed_cycles += cycles.saturating_sub(capacity);
        let first = self.completed_cycles;
        for _ in 0..cycles.min(capacity) {
            self.commit(reference_time, row);
        }
        first..self.completed_cycles
    }

    /// Physical slots of the filled rows, oldest first.
    fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        let start = (self.write_index + self.capacity - self.filled) % self.capacity;
        (0..self.filled).map(move |offset| (start + offset) % self.capacity)
    }

    pub fn snapshot(&self) -> ResultSnapshot {
        let gather =
            |column: &Vec<f64>| -> Vec<f64> { self.slots().map(|slot| column[slot]).collect() };
        ResultSnapshot {
            completed_cycles: self.completed_cycles,
            channels: self.channels.clone(),
            reference_time: self.slots().map(|slot| self.reference_time[slot]).collect(),
            mean: self.mean.iter().map(gather).collect(),
            stddev: self.stddev.iter().map(gather).collect(),
        }
    }

    /// Most recently committed row.
    pub fn latest(&self) -> Option<CycleRow> {
        let slot = self.slots().last()?;
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(column, channel)| ChannelStats {
                channel: *channel,
                mean: self.mean[column][slot],
                stddev: self.stddev[column][slot],
                samples: self.samples[column][slot],
            })
            .collect();
        Some(CycleRow {
            cycle_index: self.completed_cycles - 1,
            reference_time: self.reference_time[slot],
            channels,
        })
    }

    /// Change the row capacity, keeping the most recent rows that still fit.
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity == self.capacity {
            return;
        }
        let snapshot = self.snapshot();
        let keep = snapshot.len().min(capacity);
        let skip = snapshot.len() - keep;
        let refill = |column: &Vec<f64>| -> Vec<f64> {
            let mut resized = vec![f64::NAN; capacity];
            resized[..keep].copy_from_slice(&column[skip..]);
            resized
        };
        self.mean = snapshot.mean.iter().map(refill).collect();
        self.stddev = snapshot.stddev.iter().map(refill).collect();
        let slots: Vec<usize> = self.slots().skip(skip).collect();
        self.samples = self
            .samples
            .iter()
            .map(|column| {
                let mut resized = vec![0; capacity];
                for (row, slot) in slots.iter().enumerate() {
                    resized[row] = column[*slot];
                }
                resized
            })
            .collect();
        let mut times = vec![0; capacity];
        times[..keep].copy_from_slice(&snapshot.reference_time[skip..]);
        self.reference_time = times;
        self.capacity = capacity;
        self.filled = keep;
        self.write_index = keep % capacity;
    }
}

/// Linearized copy of the filled rows, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSnapshot {
    /// Cycles completed since the measurement started; acts as a generation counter.
    pub completed_cycles: u64,
    pub channels: Vec<i32>,
    pub reference_time: Vec<i64>,
    /// Indexed `[channel][row]`.
    pub mean: Vec<Vec<f64>>,
    pub stddev: Vec<Vec<f64>>,
}

impl ResultSnapshot {
    pub fn len(&self) -> usize {
        self.reference_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference_time.is_empty()
    }

    /// Cycle indices of the rows in this snapshot.
    pub fn cycle_indices(&self) -> Range<u64> {
        let first = self.completed_cycles - self.len() as u64;
        first..self.completed_cycles
    }

    /// Mean and stddev columns of `channel`.
    pub fn channel(&self, channel: i32) -> Option<(&[f64], &[f64])> {
        let column = self.channels.iter().position(|id| *id == channel)?;
        Some((&self.mean[column], &self.stddev[column]))
    }
}

/// Cloneable handle to a [`ResultBuffer`] shared between writer and readers.
#[derive(Debug, Clone)]
pub struct SharedResults {
    inner: Arc<RwLock<ResultBuffer>>,
}

impl SharedResults {
    pub fn new(buffer: ResultBuffer) -> Self {
        Self {
            inner: Arc::new(RwLock::new(buffer)),
        }
    }

    pub fn snapshot(&self) -> ResultSnapshot {
        self.inner.read().snapshot()
    }

    /// Snapshot only when cycles completed after the `seen` generation.
    pub fn snapshot_if_newer(&self, seen: u64) -> Option<ResultSnapshot> {
        let buffer = self.inner.read();
        (buffer.completed_cycles() > seen).then(|| buffer.snapshot())
    }

    pub fn completed_cycles(&self) -> u64 {
        self.inner.read().completed_cycles()
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    pub fn latest(&self) -> Option<CycleRow> {
        self.inner.read().latest()
    }

    pub fn resize(&self, capacity: usize) {
        self.inner.write().resize(capacity);
    }

    pub(crate) fn commit(&self, reference_time: i64, row: &[ChannelStats]) -> u64 {
        self.inner.write().commit(reference_time, row)
    }

    pub(crate) fn commit_repeated(
        &self,
        reference_time: i64,
        row: &[ChannelStats],
        cycles: u64,
    ) -> Range<u64> {
        self.inner.write().commit_repeated(reference_time, row, cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(mean: f64) -> Vec<ChannelStats> {
        vec![
            ChannelStats {
                channel: 2,
                mean,
                stddev: 1.0,
                samples: 3,
            },
            ChannelStats::missing(3),
        ]
    }

    #[test]
    fn snapshot_is_oldest_first_after_wrap() {
        let mut buffer = ResultBuffer::new(vec![2, 3], 3);
        for cycle in 0..5 {
            assert_eq!(buffer.commit(cycle * 10, &row(cycle as f64)), cycle as u64);
        }
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.completed_cycles, 5);
        assert_eq!(snapshot.reference_time, vec![20, 30, 40]);
        assert_eq!(snapshot.cycle_indices(), 2..5);
        let (mean, stddev) = snapshot.channel(2).unwrap();
        assert_eq!(mean, &[2.0, 3.0, 4.0]);
        assert_eq!(stddev, &[1.0, 1.0, 1.0]);
        let (missing, _) = snapshot.channel(3).unwrap();
        assert!(missing.iter().all(|value| value.is_nan()));
    }

    #[test]
    fn partially_filled_buffer_only_exposes_written_rows() {
        let mut buffer = ResultBuffer::new(vec![2, 3], 10);
        buffer.commit(100, &row(1.5));
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.mean[0], vec![1.5]);
        assert_eq!(buffer.write_index(), 1);
    }

    #[test]
    fn latest_reports_the_newest_row() {
        let mut buffer = ResultBuffer::new(vec![2, 3], 2);
        assert!(buffer.latest().is_none());
        for cycle in 0..3 {
            buffer.commit(cycle, &row(cycle as f64));
        }
        let latest = buffer.latest().unwrap();
        assert_eq!(latest.cycle_index, 2);
        assert_eq!(latest.reference_time, 2);
        assert_eq!(latest.channels[0].mean, 2.0);
        assert!(latest.channels[1].is_missing());
    }

    #[test]
    fn resize_keeps_most_recent_rows() {
        let mut buffer = ResultBuffer::new(vec![2, 3], 4);
        for cycle in 0..6 {
            buffer.commit(cycle, &row(cycle as f64));
        }
        buffer.resize(2);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.reference_time, vec![4, 5]);
        assert_eq!(snapshot.completed_cycles, 6);

        buffer.resize(5);
        buffer.commit(6, &row(6.0));
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.reference_time, vec![4, 5, 6]);
        assert_eq!(snapshot.mean[0], vec![4.0, 5.0, 6.0]);
        assert_eq!(snapshot.cycle_indices(), 4..7);
    }

    #[test]
    fn shared_handle_reports_new_generations_only() {
        let shared = SharedResults::new(ResultBuffer::new(vec![2, 3], 4));
        assert!(shared.snapshot_if_newer(0).is_none());
        shared.commit(1, &row(0.0));
        let snapshot = shared.snapshot_if_newer(0).unwrap();
        assert_eq!(snapshot.completed_cycles, 1);
        assert!(shared.snapshot_if_newer(1).is_none());
    }

    #[test]
    fn repeated_commit_writes_at_most_one_ring() {
        let mut buffer = ResultBuffer::new(vec![2, 3], 4);
        buffer.commit(10, &row(1.0));
        assert_eq!(buffer.commit_repeated(20, &row(2.0), 2), 1..3);

        let stored = buffer.commit_repeated(30, &row(3.0), 1_000);
        assert_eq!(stored, 999..1_003);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.cycle_indices(), 999..1_003);
        assert_eq!(snapshot.mean[0], vec![3.0; 4]);
        assert_eq!(snapshot.reference_time, vec![30; 4]);
    }
}
