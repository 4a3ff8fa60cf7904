//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Reference-cycle correlation of signal channels."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Reference correlation.
//!
//! Every reference tag opens a window of one period. Signal tags are stored
//! relative to a per-channel anchor offset and, when the next reference
//! arrives, those falling in `[-period/2, period/2)` around the previous
//! reference are recorded into the channel histogram. After `average_count`
//! reference periods the histograms are reduced into one result row.

use tracing::{debug, info};

use pps_common::{ConfigError, MeasurementConfig, OffsetMode};

use crate::aggregate::{ChannelStats, Histogram};
use crate::events::{BufferKind, TrackerEvent};
use crate::results::{CycleRow, ResultBuffer, SharedResults};
use crate::ring::RingBuffer;
use crate::tag::TagEvent;

/// Whether a channel has fixed its anchor offset for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    Unanchored,
    Anchored { offset: i64 },
}

/// A buffered signal tag, stored as `time - offset` with the anchor offset
/// that was active when it arrived.
#[derive(Debug, Clone, Copy, Default)]
struct PendingTag {
    stored: i64,
    offset: i64,
}

#[derive(Debug)]
pub struct ChannelState {
    channel: i32,
    name: String,
    anchor: AnchorState,
    pending: RingBuffer<PendingTag>,
    histogram: Histogram,
    dropped: u64,
}

impl ChannelState {
    fn new(channel: i32, name: String, pending: usize, histogram: usize) -> Self {
        Self {
            channel,
            name,
            anchor: AnchorState::Unanchored,
            pending: RingBuffer::with_capacity(pending),
            histogram: Histogram::new(histogram),
            dropped: 0,
        }
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn anchor(&self) -> AnchorState {
        self.anchor
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn recorded(&self) -> usize {
        self.histogram.len()
    }

    fn store(&mut self, time: i64, offset: i64) {
        let tag = PendingTag {
            stored: time - offset,
            offset,
        };
        if self.pending.push_overwrite(tag).is_some() {
            self.dropped += 1;
        }
    }

    /// Move buffered tags inside the window around `reference` into the
    /// histogram. Stale tags are discarded; the first tag at or beyond the
    /// upper edge stops the drain and stays buffered.
    fn drain(&mut self, reference: i64, half_period: i64, mode: OffsetMode) {
        while let Some(PendingTag { stored, offset }) = self.pending.front() {
            let diff = stored - reference;
            if diff < -half_period {
                self.pending.pop_front();
                continue;
            }
            if diff >= half_period {
                break;
            }
            self.pending.pop_front();
            let value = match mode {
                OffsetMode::Absolute => diff + offset,
                OffsetMode::Relative => diff,
            };
            self.histogram.record(value);
        }
    }

    /// Buffered tags keep the offset they were stored with; the next tag
    /// re-anchors the channel.
    fn unanchor(&mut self) {
        self.anchor = AnchorState::Unanchored;
    }
}

/// Output of one [`ReferenceCorrelator::process`] call.
#[derive(Debug, Default)]
pub struct CorrelatorOutput {
    pub rows: Vec<CycleRow>,
    pub events: Vec<TrackerEvent>,
}

#[derive(Debug)]
pub struct ReferenceCorrelator {
    reference_channel: i32,
    period: i64,
    average_count: u32,
    mode: OffsetMode,
    wrap_anchor: bool,
    previous_reference: Option<i64>,
    cycle_count: u32,
    channels: Vec<ChannelState>,
    row: Vec<ChannelStats>,
    results: SharedResults,
}

impl ReferenceCorrelator {
    pub fn new(config: &MeasurementConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let reference = config.reference()?;
        let histogram = config.histogram_capacity();
        let channels: Vec<ChannelState> = config
            .signals
            .iter()
            .map(|signal| {
                ChannelState::new(
                    signal.channel,
                    signal.display_name(),
                    config.buffers.pending_tags,
                    histogram,
                )
            })
            .collect();
        let ids = channels.iter().map(ChannelState::channel).collect();
        Ok(Self {
            reference_channel: reference.channel,
            period: reference.period_ps,
            average_count: reference.average_count,
            mode: config.offset_mode,
            wrap_anchor: config.wrap_anchor,
            previous_reference: None,
            cycle_count: 0,
            row: Vec::with_capacity(channels.len()),
            channels,
            results: SharedResults::new(ResultBuffer::new(ids, config.buffers.results)),
        })
    }

    pub fn reference_channel(&self) -> i32 {
        self.reference_channel
    }

    pub fn results(&self) -> SharedResults {
        self.results.clone()
    }

    pub fn channels(&self) -> &[ChannelState] {
        &self.channels
    }

    pub fn channel(&self, channel: i32) -> Option<&ChannelState> {
        self.channels.iter().find(|state| state.channel == channel)
    }

    pub fn is_registered(&self, channel: i32) -> bool {
        channel == self.reference_channel || self.channel(channel).is_some()
    }

    /// Reference periods folded into the cycle that is still open.
    pub fn cycle_count(&self) -> u32 {
        self.cycle_count
    }

    pub fn previous_reference(&self) -> Option<i64> {
        self.previous_reference
    }

    pub fn anchored_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|state| matches!(state.anchor, AnchorState::Anchored { .. }))
            .count()
    }

    /// Fold one tag in stream order. Tags on unregistered channels are ignored.
    pub fn process(&mut self, tag: &TagEvent, out: &mut CorrelatorOutput) {
        if tag.channel == self.reference_channel {
            if tag.is_overflow() {
                self.on_reference_overflow(tag, out);
            } else {
                self.on_reference(tag.time, out);
            }
        } else if tag.is_overflow() {
            if self.channel(tag.channel).is_some() {
                out.events.push(TrackerEvent::SignalOverflow {
                    channel: tag.channel,
                    missed: tag.missed,
                });
            }
        } else {
            self.on_signal(tag);
        }
    }

    fn on_signal(&mut self, tag: &TagEvent) {
        let previous = self.previous_reference;
        let period = self.period;
        let wrap = self.wrap_anchor;
        let Some(state) = self
            .channels
            .iter_mut()
            .find(|state| state.channel == tag.channel)
        else {
            return;
        };
        let offset = match (state.anchor, previous) {
            (AnchorState::Anchored { offset }, _) => offset,
            (AnchorState::Unanchored, Some(reference)) => {
                let raw = tag.time - reference;
                let offset = if wrap { wrap_offset(raw, period) } else { raw };
                state.anchor = AnchorState::Anchored { offset };
                debug!(channel = state.channel, offset, "channel anchored");
                offset
            }
            // Nothing to anchor against before the first reference.
            (AnchorState::Unanchored, None) => return,
        };
        state.store(tag.time, offset);
    }

    fn on_reference(&mut self, time: i64, out: &mut CorrelatorOutput) {
        if self.previous_reference.is_none() && self.results.completed_cycles() == 0 {
            info!(channel = self.reference_channel, time, "reference signal received");
        }
        if let Some(previous) = self.previous_reference {
            let half_period = self.period / 2;
            for state in &mut self.channels {
                state.drain(previous, half_period, self.mode);
            }
        }
        self.previous_reference = Some(time);
        self.cycle_count += 1;
        if self.cycle_count >= self.average_count {
            self.cycle_count = 0;
            self.close_cycle(time, out);
        }
    }

    fn on_reference_overflow(&mut self, tag: &TagEvent, out: &mut CorrelatorOutput) {
        out.events.push(TrackerEvent::ReferenceOverflow {
            channel: tag.channel,
            missed: tag.missed,
        });
        self.previous_reference = None;
        let count = u64::from(self.cycle_count) + u64::from(tag.missed);
        let average = u64::from(self.average_count);
        let closes = count / average;
        // Remainder of a division by a `u32`, so it fits.
        self.cycle_count = (count % average) as u32;
        if closes == 0 {
            return;
        }
        // The open cycle may still hold samples from before the overflow.
        self.close_cycle(tag.time, out);
        if closes > 1 {
            self.close_empty_cycles(tag.time, closes - 1, out);
        }
    }

    /// Close `cycles` cycles that cannot hold any sample. Only the rows the
    /// result ring can keep are written; one event covers the whole gap.
    fn close_empty_cycles(
        &mut self,
        reference_time: i64,
        cycles: u64,
        out: &mut CorrelatorOutput,
    ) {
        self.row.clear();
        for state in &mut self.channels {
            state.unanchor();
            self.row.push(ChannelStats::missing(state.channel));
        }
        let first_cycle = self.results.completed_cycles();
        for cycle_index in self.results.commit_repeated(reference_time, &self.row, cycles) {
            out.rows.push(CycleRow {
                cycle_index,
                reference_time,
                channels: self.row.clone(),
            });
        }
        out.events.push(TrackerEvent::MissedCycles {
            first_cycle,
            cycles,
        });
    }

    /// Reduce every histogram into one row and commit it atomically.
    fn close_cycle(&mut self, reference_time: i64, out: &mut CorrelatorOutput) {
        let cycle = self.results.completed_cycles();
        self.row.clear();
        for state in &mut self.channels {
            let stats = state.histogram.stats(state.channel);
            if stats.is_missing() {
                out.events.push(TrackerEvent::MissingChannelData {
                    channel: state.channel,
                    cycle,
                });
                state.unanchor();
            }
            state.histogram.reset();
            self.row.push(stats);
        }
        let cycle_index = self.results.commit(reference_time, &self.row);
        out.rows.push(CycleRow {
            cycle_index,
            reference_time,
            channels: self.row.clone(),
        });
    }

    /// Drain per-channel loss counters into overflow events.
    pub fn take_overflow_events(&mut self, events: &mut Vec<TrackerEvent>) {
        for state in &mut self.channels {
            let pending = std::mem::take(&mut state.dropped);
            if pending > 0 {
                events.push(TrackerEvent::BufferOverflow {
                    buffer: BufferKind::Pending,
                    channel: state.channel,
                    dropped: pending,
                });
            }
            let histogram = state.histogram.take_dropped();
            if histogram > 0 {
                events.push(TrackerEvent::BufferOverflow {
                    buffer: BufferKind::Histogram,
                    channel: state.channel,
                    dropped: histogram,
                });
            }
        }
    }
}

/// Fold an anchor offset into `[half - period, half)` with `half = period / 2`.
/// For even periods that is `[-period/2, period/2)`; an odd period puts the
/// extra residue on the negative side.
pub fn wrap_offset(offset: i64, period: i64) -> i64 {
    let half = period / 2;
    let wrapped = offset.rem_euclid(period);
    if wrapped >= half {
        wrapped - period
    } else {
        wrapped
    }
}
