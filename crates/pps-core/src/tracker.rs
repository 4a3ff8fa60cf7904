//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Batch-driven tracker wiring rescaler, correlator and result store."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! The tracker consumes batches of tags in stream order on a single thread.
//! Results and messages are shared with readers through lock-protected
//! handles; the only cross-thread control is the [`ShutdownHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use pps_common::time::monotonic_now;
use pps_common::MeasurementConfig;
use pps_metrics::{SharedRegistry, TrackerMetrics};

use crate::correlator::{CorrelatorOutput, ReferenceCorrelator};
use crate::error::{Result, TrackerError};
use crate::events::{BufferKind, MessageLog, Severity, SharedMessageLog, TrackerEvent};
use crate::rescale::{RescaleStats, TagRescaler};
use crate::results::{CycleRow, SharedResults};
use crate::tag::TagEvent;

/// Cooperative stop flag, checked at the start of every batch.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Everything one batch produced.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Tags on registered channels that were consumed.
    pub tags: usize,
    pub rows: Vec<CycleRow>,
    pub events: Vec<TrackerEvent>,
}

pub struct Tracker {
    rescaler: Option<TagRescaler>,
    correlator: ReferenceCorrelator,
    results: SharedResults,
    messages: SharedMessageLog,
    metrics: Option<TrackerMetrics>,
    shutdown: ShutdownHandle,
    no_signal_threshold: Duration,
    last_signal: Instant,
    tags_processed: u64,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("rescaler", &self.rescaler)
            .field("correlator", &self.correlator)
            .field("tags_processed", &self.tags_processed)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    pub fn new(config: &MeasurementConfig) -> Result<Self> {
        let correlator = ReferenceCorrelator::new(config)?;
        let rescaler = config
            .clock
            .as_ref()
            .map(|clock| TagRescaler::new(clock, config.buffers.rescale_queue));
        let results = correlator.results();
        let messages = MessageLog::shared(config.buffers.messages);

        let reference = config.reference()?;
        let signals: Vec<String> = config
            .signals
            .iter()
            .map(|signal| signal.display_name())
            .collect();
        info!(
            reference = reference.channel,
            period_ps = reference.period_ps,
            average_count = reference.average_count,
            clock = ?config.clock.as_ref().map(|clock| clock.channel),
            signals = ?signals,
            "tracker configured"
        );
        messages.lock().push(
            Severity::Info,
            format!(
                "measurement started: {} on input {} against {}",
                reference.name,
                reference.channel,
                signals.join(", ")
            ),
        );

        Ok(Self {
            rescaler,
            correlator,
            results,
            messages,
            metrics: None,
            shutdown: ShutdownHandle::default(),
            no_signal_threshold: config.no_signal_threshold,
            last_signal: monotonic_now(),
            tags_processed: 0,
        })
    }

    pub fn with_metrics(mut self, metrics: TrackerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register tracker counters on `registry` and publish into them.
    pub fn with_registry(self, registry: SharedRegistry) -> Result<Self> {
        let metrics = TrackerMetrics::new(registry)?;
        Ok(self.with_metrics(metrics))
    }

    pub fn results(&self) -> SharedResults {
        self.results.clone()
    }

    pub fn messages(&self) -> SharedMessageLog {
        self.messages.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn correlator(&self) -> &ReferenceCorrelator {
        &self.correlator
    }

    pub fn rescaler(&self) -> Option<&TagRescaler> {
        self.rescaler.as_ref()
    }

    pub fn tags_processed(&self) -> u64 {
        self.tags_processed
    }

    pub fn stop(&self) {
        self.shutdown.stop();
    }

    fn accepts(&self, channel: i32) -> bool {
        self.correlator.is_registered(channel)
            || self
                .rescaler
                .as_ref()
                .is_some_and(|rescaler| rescaler.clock_channel() == channel)
    }

    pub fn process_batch(&mut self, tags: &[TagEvent]) -> Result<BatchReport> {
        self.process_batch_at(tags, monotonic_now())
    }

    /// Process one batch, using `now` for the no-signal watchdog.
    pub fn process_batch_at(&mut self, tags: &[TagEvent], now: Instant) -> Result<BatchReport> {
        if self.shutdown.is_stopped() {
            return Err(TrackerError::Stopped);
        }

        let mut out = CorrelatorOutput::default();
        let mut accepted = 0usize;
        for tag in tags {
            if !self.accepts(tag.channel) {
                continue;
            }
            accepted += 1;
            match self.rescaler.as_mut() {
                Some(rescaler) => {
                    for rescaled in rescaler.feed(*tag) {
                        self.correlator.process(&rescaled, &mut out);
                    }
                }
                None => self.correlator.process(tag, &mut out),
            }
        }
        self.tags_processed += accepted as u64;

        let mut events = std::mem::take(&mut out.events);
        if let Some(rescaler) = self.rescaler.as_mut() {
            let clock_channel = rescaler.clock_channel();
            rescale_events(clock_channel, rescaler.take_stats(), &mut events);
        }
        self.correlator.take_overflow_events(&mut events);

        if accepted > 0 {
            self.last_signal = now;
        } else if now.duration_since(self.last_signal) >= self.no_signal_threshold {
            events.push(TrackerEvent::NoSignal {
                seconds: self.no_signal_threshold.as_secs(),
            });
            self.last_signal = now;
        }

        self.publish(accepted, &out.rows, &events);
        Ok(BatchReport {
            tags: accepted,
            rows: out.rows,
            events,
        })
    }

    fn publish(&self, accepted: usize, rows: &[CycleRow], events: &[TrackerEvent]) {
        for row in rows {
            debug!(
                cycle = row.cycle_index,
                reference_time = row.reference_time,
                "cycle closed"
            );
        }
        if !events.is_empty() {
            let mut log = self.messages.lock();
            for event in events {
                event.trace();
                log.push_event(event);
            }
        }

        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.add_tags(accepted);
        let mut cycles = rows.len() as u64;
        for event in events {
            match event {
                TrackerEvent::BufferOverflow {
                    buffer,
                    channel,
                    dropped,
                } => metrics.record_dropped(buffer.as_str(), *channel, *dropped),
                TrackerEvent::DegenerateFit { tags, .. } => metrics.record_degenerate(*tags),
                TrackerEvent::MissingChannelData { channel, .. } => {
                    metrics.record_missing(*channel, 1)
                }
                TrackerEvent::MissedCycles { cycles: missed, .. } => {
                    // Rows beyond the ring capacity were never materialised.
                    cycles += missed.saturating_sub(self.results.capacity() as u64);
                    for state in self.correlator.channels() {
                        metrics.record_missing(state.channel(), *missed);
                    }
                }
                TrackerEvent::ClockOverflow { .. } => metrics.inc_clock_overflows(),
                _ => {}
            }
        }
        metrics.add_cycles(cycles);
        metrics.set_anchored(self.correlator.anchored_channels());
    }
}

fn rescale_events(clock_channel: i32, stats: RescaleStats, events: &mut Vec<TrackerEvent>) {
    for overflow in stats.clock_overflows {
        events.push(TrackerEvent::ClockOverflow {
            channel: clock_channel,
            missed: overflow.missed,
            nominal_time: overflow.nominal_time,
        });
    }
    for (channel, dropped) in stats.dropped {
        events.push(TrackerEvent::BufferOverflow {
            buffer: BufferKind::RescaleQueue,
            channel,
            dropped,
        });
    }
    if stats.degenerate > 0 {
        events.push(TrackerEvent::DegenerateFit {
            tags: stats.degenerate,
            cycle_length: stats.last_cycle_length,
        });
    }
    if stats.unmapped > 0 {
        events.push(TrackerEvent::UnmappedTags {
            tags: stats.unmapped,
        });
    }
}
