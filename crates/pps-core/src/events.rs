//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Recoverable tracker conditions and the bounded message log."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferKind {
    RescaleQueue,
    Pending,
    Histogram,
}

impl BufferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferKind::RescaleQueue => "rescale_queue",
            BufferKind::Pending => "pending",
            BufferKind::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

/// Conditions the tracker recovers from on its own. Each one is logged,
/// appended to the [`MessageLog`] and returned in the batch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    DegenerateFit { tags: u64, cycle_length: i64 },
    BufferOverflow { buffer: BufferKind, channel: i32, dropped: u64 },
    MissingChannelData { channel: i32, cycle: u64 },
    MissedCycles { first_cycle: u64, cycles: u64 },
    ClockOverflow { channel: i32, missed: u32, nominal_time: i64 },
    ReferenceOverflow { channel: i32, missed: u32 },
    SignalOverflow { channel: i32, missed: u32 },
    UnmappedTags { tags: u64 },
    NoSignal { seconds: u64 },
}

impl TrackerEvent {
    pub fn severity(&self) -> Severity {
        match self {
            TrackerEvent::ClockOverflow { .. }
            | TrackerEvent::ReferenceOverflow { .. }
            | TrackerEvent::SignalOverflow { .. } => Severity::Info,
            _ => Severity::Warning,
        }
    }

    /// Forward the event to tracing at its severity.
    pub fn trace(&self) {
        match self.severity() {
            Severity::Info => info!(event = ?self, "{self}"),
            Severity::Warning => warn!(event = ?self, "{self}"),
        }
    }
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerEvent::DegenerateFit { tags, cycle_length } => write!(
                f,
                "clock fit interval of {cycle_length} ps; {tags} tag(s) forwarded without rescaling"
            ),
            TrackerEvent::BufferOverflow {
                buffer,
                channel,
                dropped,
            } => write!(
                f,
                "{} buffer full on input {channel}; {dropped} sample(s) dropped",
                buffer.as_str()
            ),
            TrackerEvent::MissingChannelData { channel, cycle } => {
                write!(f, "tags missing: input {channel} in cycle {cycle}")
            }
            TrackerEvent::MissedCycles {
                first_cycle,
                cycles,
            } => write!(
                f,
                "reference lost: {cycles} cycle(s) from cycle {first_cycle} closed without data"
            ),
            TrackerEvent::ClockOverflow {
                channel,
                missed,
                nominal_time,
            } => write!(
                f,
                "overflow on clock input {channel}: {missed} tick(s) skipped, nominal time now {nominal_time} ps"
            ),
            TrackerEvent::ReferenceOverflow { channel, missed } => {
                write!(f, "overflow on reference input {channel}: {missed} event(s) missed")
            }
            TrackerEvent::SignalOverflow { channel, missed } => {
                write!(f, "overflow on input {channel}: {missed} event(s) missed")
            }
            TrackerEvent::UnmappedTags { tags } => write!(
                f,
                "{tags} tag(s) discarded: clock overflow before a fitted interval existed"
            ),
            TrackerEvent::NoSignal { seconds } => {
                write!(f, "no tags received for {seconds} s; check signal connections")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedMessage {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub text: String,
}

impl fmt::Display for LoggedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.text,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Bounded, indexed log of user-facing messages. Indices keep increasing
/// after old entries are evicted so readers can poll incrementally.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: VecDeque<LoggedMessage>,
    capacity: usize,
    next_index: u64,
}

pub type SharedMessageLog = Arc<Mutex<MessageLog>>;

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedMessageLog {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn push(&mut self, severity: Severity, text: impl Into<String>) -> u64 {
        self.push_at(Utc::now(), severity, text)
    }

    pub fn push_at(
        &mut self,
        timestamp: DateTime<Utc>,
        severity: Severity,
        text: impl Into<String>,
    ) -> u64 {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let index = self.next_index;
        self.entries.push_back(LoggedMessage {
            index,
            timestamp,
            severity,
            text: text.into(),
        });
        self.next_index += 1;
        index
    }

    pub fn push_event(&mut self, event: &TrackerEvent) -> u64 {
        self.push(event.severity(), event.to_string())
    }

    /// Index the next message will receive.
    pub fn message_index(&self) -> u64 {
        self.next_index
    }

    /// Retained messages with an index of at least `index`.
    pub fn messages_since(&self, index: u64) -> Vec<LoggedMessage> {
        self.entries
            .iter()
            .filter(|message| message.index >= index)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
