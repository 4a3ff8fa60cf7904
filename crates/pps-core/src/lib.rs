//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Streaming PPS correlation core."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Streaming correlation core.
//!
//! Tags flow through an optional [`TagRescaler`] that removes tagger drift
//! against an external clock, then into the [`ReferenceCorrelator`] which
//! bins signal offsets per reference period and reduces them into
//! [`ResultBuffer`] rows every `average_count` periods. [`Tracker`] wires the
//! stages together and drives them one batch at a time.

pub mod aggregate;
pub mod clock;
pub mod correlator;
pub mod error;
pub mod events;
pub mod rescale;
pub mod results;
pub mod ring;
pub mod tag;
pub mod tracker;

pub use aggregate::{reduce, ChannelStats, Histogram};
pub use clock::{AnchorInterval, ClockFitter, FittedAnchor, WindowMode};
pub use correlator::{AnchorState, ChannelState, CorrelatorOutput, ReferenceCorrelator};
pub use error::{Result, TrackerError};
pub use events::{
    BufferKind, LoggedMessage, MessageLog, Severity, SharedMessageLog, TrackerEvent,
};
pub use rescale::{RescaleStats, TagRescaler};
pub use results::{CycleRow, ResultBuffer, ResultSnapshot, SharedResults};
pub use ring::RingBuffer;
pub use tag::{TagEvent, TagKind};
pub use tracker::{BatchReport, ShutdownHandle, Tracker};
