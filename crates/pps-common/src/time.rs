//! ---
//! pps_section: "01-core-functionality"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Picosecond time helpers."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

pub const PS_PER_NANOSECOND: i64 = 1_000;
pub const PS_PER_MICROSECOND: i64 = 1_000_000;
pub const PS_PER_SECOND: i64 = 1_000_000_000_000;

/// Capture an instant suitable for watchdog comparisons.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Tagger timestamps are picoseconds; this is lossy above ~104 days.
pub fn ps_to_seconds(ps: i64) -> f64 {
    ps as f64 / PS_PER_SECOND as f64
}

pub fn ps_to_duration(ps: i64) -> Duration {
    let ps = ps.max(0) as u64;
    Duration::from_nanos(ps / PS_PER_NANOSECOND as u64)
}

/// Render a picosecond quantity with the largest unit that keeps it above 1.
pub fn format_ps(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_owned();
    }
    let magnitude = value.abs();
    if magnitude >= PS_PER_SECOND as f64 {
        format!("{:.6} s", value / PS_PER_SECOND as f64)
    } else if magnitude >= PS_PER_MICROSECOND as f64 * 1_000.0 {
        format!("{:.3} ms", value / (PS_PER_MICROSECOND as f64 * 1_000.0))
    } else if magnitude >= PS_PER_MICROSECOND as f64 {
        format!("{:.3} us", value / PS_PER_MICROSECOND as f64)
    } else if magnitude >= PS_PER_NANOSECOND as f64 {
        format!("{:.3} ns", value / PS_PER_NANOSECOND as f64)
    } else {
        format!("{value:.1} ps")
    }
}
