//! ---
//! pps_section: "02-correlation-core"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Fatal tracker errors."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use pps_common::ConfigError;
use pps_metrics::prometheus;
use thiserror::Error;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Errors that stop a tracker from being built or from accepting input.
/// Per-tag conditions are reported as [`crate::TrackerEvent`]s instead.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid measurement configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("tracker has been stopped; batch rejected")]
    Stopped,
    #[error("failed to register tracker metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}
