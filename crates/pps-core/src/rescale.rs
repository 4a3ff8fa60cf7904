//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Queue that rewrites tag times onto the external clock lattice."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Tag rescaling against a [`ClockFitter`].
//!
//! Tags on non-clock channels wait in a bounded queue until a fitted anchor
//! later than them exists, then leave in arrival order with their time mapped
//! onto the clock lattice. Overflow markers on non-clock channels travel
//! through the same queue so stream order is preserved.

use tracing::debug;

use pps_common::ClockConfig;

use crate::clock::{AnchorInterval, ClockFitter};
use crate::ring::RingBuffer;
use crate::tag::TagEvent;

/// Losses and fallbacks accumulated since the last [`TagRescaler::take_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescaleStats {
    /// Tags evicted from a full queue, per input channel.
    pub dropped: Vec<(i32, u64)>,
    /// Tags forwarded unrescaled because the fitted interval was not positive.
    pub degenerate: u64,
    pub last_cycle_length: i64,
    /// Tags discarded because no anchor pair existed when the clock overflowed.
    pub unmapped: u64,
    pub clock_overflows: Vec<ClockOverflowRecord>,
}

impl RescaleStats {
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty()
            && self.degenerate == 0
            && self.unmapped == 0
            && self.clock_overflows.is_empty()
    }

    fn record_drop(&mut self, channel: i32) {
        match self.dropped.iter_mut().find(|(id, _)| *id == channel) {
            Some((_, count)) => *count += 1,
            None => self.dropped.push((channel, 1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOverflowRecord {
    pub missed: u32,
    pub nominal_time: i64,
}

#[derive(Debug, Clone, Copy)]
enum DrainLimit {
    Nothing,
    Before(i64),
    Everything,
}

#[derive(Debug)]
pub struct TagRescaler {
    clock_channel: i32,
    fitter: ClockFitter,
    queue: RingBuffer<TagEvent>,
    stats: RescaleStats,
}

impl TagRescaler {
    pub fn new(clock: &ClockConfig, queue_capacity: usize) -> Self {
        Self {
            clock_channel: clock.channel,
            fitter: ClockFitter::new(clock.period_ps, clock.window),
            queue: RingBuffer::with_capacity(queue_capacity),
            stats: RescaleStats::default(),
        }
    }

    pub fn clock_channel(&self) -> i32 {
        self.clock_channel
    }

    pub fn fitter(&self) -> &ClockFitter {
        &self.fitter
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn take_stats(&mut self) -> RescaleStats {
        std::mem::take(&mut self.stats)
    }

    /// Feed one tag and iterate over the tags it releases.
    ///
    /// Clock ticks release every queued tag earlier than the new fitted
    /// anchor. A clock overflow releases the whole queue against the anchors
    /// that existed before it, then restarts the fit. Any other tag is queued
    /// and releases nothing. Tags still unread when the iterator is dropped
    /// stay queued for the next release.
    pub fn feed(&mut self, tag: TagEvent) -> Rescaled<'_> {
        let (interval, limit) = if tag.channel != self.clock_channel {
            self.enqueue(tag);
            (None, DrainLimit::Nothing)
        } else if tag.is_overflow() {
            let interval = self.fitter.interval();
            self.fitter.on_overflow(tag.missed);
            self.stats.clock_overflows.push(ClockOverflowRecord {
                missed: tag.missed,
                nominal_time: self.fitter.nominal_time(),
            });
            (interval, DrainLimit::Everything)
        } else {
            let anchor = self.fitter.on_tick(tag.time);
            match self.fitter.interval() {
                Some(interval) => (Some(interval), DrainLimit::Before(anchor.fitted)),
                None => (None, DrainLimit::Nothing),
            }
        };
        Rescaled {
            queue: &mut self.queue,
            stats: &mut self.stats,
            interval,
            limit,
        }
    }

    fn enqueue(&mut self, tag: TagEvent) {
        if let Some(evicted) = self.queue.push_overwrite(tag) {
            self.stats.record_drop(evicted.channel);
            debug!(
                channel = evicted.channel,
                time = evicted.time,
                "rescale queue full; oldest tag dropped"
            );
        }
    }
}

/// Lazy release of rescaled tags produced by [`TagRescaler::feed`].
pub struct Rescaled<'a> {
    queue: &'a mut RingBuffer<TagEvent>,
    stats: &'a mut RescaleStats,
    interval: Option<AnchorInterval>,
    limit: DrainLimit,
}

impl Iterator for Rescaled<'_> {
    type Item = TagEvent;

    fn next(&mut self) -> Option<TagEvent> {
        loop {
            let front = self.queue.front()?;
            match self.limit {
                DrainLimit::Nothing => return None,
                DrainLimit::Before(limit) if front.time >= limit => return None,
                _ => {}
            }
            self.queue.pop_front();

            let Some(interval) = self.interval else {
                if front.is_overflow() {
                    return Some(front);
                }
                self.stats.unmapped += 1;
                continue;
            };
            return match interval.map(front.time) {
                Some(time) => Some(front.with_time(time)),
                None if front.is_overflow() => Some(front),
                None => {
                    if self.stats.degenerate == 0 {
                        debug!(
                            cycle_length = interval.cycle_length(),
                            "degenerate clock fit; forwarding tag unrescaled"
                        );
                    }
                    self.stats.degenerate += 1;
                    self.stats.last_cycle_length = interval.cycle_length();
                    Some(front)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: i32 = 7;
    const PERIOD: i64 = 1_000;

    fn rescaler(queue: usize) -> TagRescaler {
        TagRescaler::new(&ClockConfig::new(CLOCK, PERIOD).with_window(4), queue)
    }

    fn feed(rescaler: &mut TagRescaler, tag: TagEvent) -> Vec<TagEvent> {
        rescaler.feed(tag).collect()
    }

    #[test]
    fn tags_wait_for_a_later_anchor() {
        let mut rescaler = rescaler(16);
        assert!(feed(&mut rescaler, TagEvent::normal(CLOCK, 0)).is_empty());
        assert!(feed(&mut rescaler, TagEvent::normal(2, 500)).is_empty());
        assert_eq!(rescaler.queued(), 1);

        let released = feed(&mut rescaler, TagEvent::normal(CLOCK, 1_000));
        assert_eq!(released, vec![TagEvent::normal(2, 500)]);

        feed(&mut rescaler, TagEvent::normal(2, 1_250));
        feed(&mut rescaler, TagEvent::normal(2, 2_300));
        let released = feed(&mut rescaler, TagEvent::normal(CLOCK, 2_000));
        assert_eq!(released, vec![TagEvent::normal(2, 1_250)]);
        assert_eq!(rescaler.queued(), 1);
    }

    #[test]
    fn slow_tagger_is_stretched_onto_the_lattice() {
        let mut rescaler = rescaler(16);
        for k in 0..3 {
            feed(&mut rescaler, TagEvent::normal(CLOCK, k * 900));
        }
        feed(&mut rescaler, TagEvent::normal(3, 2_250));
        let released = feed(&mut rescaler, TagEvent::normal(CLOCK, 2_700));
        assert_eq!(released, vec![TagEvent::normal(3, 2_500)]);
    }

    #[test]
    fn release_preserves_arrival_order_across_channels() {
        let mut rescaler = rescaler(16);
        feed(&mut rescaler, TagEvent::normal(CLOCK, 0));
        feed(&mut rescaler, TagEvent::normal(CLOCK, 1_000));
        for (channel, time) in [(1, 1_100), (2, 1_200), (1, 1_300), (3, 1_400)] {
            feed(&mut rescaler, TagEvent::normal(channel, time));
        }
        let released = feed(&mut rescaler, TagEvent::normal(CLOCK, 2_000));
        let channels: Vec<i32> = released.iter().map(|tag| tag.channel).collect();
        assert_eq!(channels, vec![1, 2, 1, 3]);
    }

    #[test]
    fn full_queue_drops_oldest_and_counts_it() {
        let mut rescaler = rescaler(2);
        for time in [10, 20, 30] {
            feed(&mut rescaler, TagEvent::normal(4, time));
        }
        let stats = rescaler.take_stats();
        assert_eq!(stats.dropped, vec![(4, 1)]);
        assert_eq!(rescaler.queued(), 2);
        assert!(rescaler.take_stats().is_empty());
    }

    #[test]
    fn clock_overflow_flushes_with_previous_anchors() {
        let mut rescaler = rescaler(16);
        feed(&mut rescaler, TagEvent::normal(CLOCK, 0));
        feed(&mut rescaler, TagEvent::normal(CLOCK, 1_000));
        feed(&mut rescaler, TagEvent::normal(2, 1_600));
        feed(&mut rescaler, TagEvent::overflow(5, 1_700, 3));

        let released = feed(&mut rescaler, TagEvent::overflow(CLOCK, 1_800, 4));
        assert_eq!(
            released,
            vec![TagEvent::normal(2, 1_600), TagEvent::overflow(5, 1_700, 3)]
        );
        let stats = rescaler.take_stats();
        assert_eq!(
            stats.clock_overflows,
            vec![ClockOverflowRecord {
                missed: 4,
                nominal_time: 5 * PERIOD,
            }]
        );

        let anchor = rescaler.fitter.on_tick(7_000);
        assert_eq!(anchor.nominal, 6 * PERIOD);
    }

    #[test]
    fn overflow_without_anchor_pair_discards_queue() {
        let mut rescaler = rescaler(16);
        feed(&mut rescaler, TagEvent::normal(CLOCK, 0));
        feed(&mut rescaler, TagEvent::normal(2, 400));
        feed(&mut rescaler, TagEvent::normal(2, 600));
        assert!(feed(&mut rescaler, TagEvent::overflow(CLOCK, 900, 1)).is_empty());
        assert_eq!(rescaler.queued(), 0);
        assert_eq!(rescaler.take_stats().unmapped, 2);
    }

    #[test]
    fn degenerate_fit_forwards_tags_unchanged() {
        let mut rescaler = rescaler(16);
        feed(&mut rescaler, TagEvent::normal(CLOCK, 5_000));
        feed(&mut rescaler, TagEvent::normal(2, 4_000));
        // A tick earlier than the previous one yields a negative interval.
        let released = feed(&mut rescaler, TagEvent::normal(CLOCK, 4_500));
        assert_eq!(released, vec![TagEvent::normal(2, 4_000)]);
        let stats = rescaler.take_stats();
        assert_eq!(stats.degenerate, 1);
        assert!(stats.last_cycle_length <= 0);
    }
}
