//! ---
//! pps_section: "01-core-functionality"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Shared primitives for the tracking workspace."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Shared primitives for the PPS tracking workspace.
//! This crate exposes configuration loading, tracing setup and picosecond
//! time helpers consumed by the core, simulator and daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, BufferConfig, ClockConfig, ConfigError, LoggingConfig, MeasurementConfig,
    MetricsConfig, OffsetMode, ReferenceConfig, SignalConfig, SCHEMA_VERSION,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
