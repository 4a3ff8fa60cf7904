//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Time tag event model."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Whether a tag is a timestamp or a missed-event marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    #[default]
    Normal,
    Overflow,
}

/// A single hardware timestamp on one input channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TagEvent {
    pub channel: i32,
    /// Picoseconds on the tagger timebase.
    pub time: i64,
    #[serde(default)]
    pub kind: TagKind,
    /// Events lost inside an overflow region; zero for normal tags.
    #[serde(default)]
    pub missed: u32,
}

impl TagEvent {
    pub fn normal(channel: i32, time: i64) -> Self {
        Self {
            channel,
            time,
            kind: TagKind::Normal,
            missed: 0,
        }
    }

    pub fn overflow(channel: i32, time: i64, missed: u32) -> Self {
        Self {
            channel,
            time,
            kind: TagKind::Overflow,
            missed,
        }
    }

    pub fn is_overflow(&self) -> bool {
        self.kind == TagKind::Overflow
    }

    pub fn with_time(self, time: i64) -> Self {
        Self { time, ..self }
    }
}
