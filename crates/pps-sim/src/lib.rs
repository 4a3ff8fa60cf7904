//! ---
//! pps_section: "04-simulation"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Synthetic tag source and replay exports."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Tag sources for exercising the tracker without hardware: a seeded
//! generator and a replay of recorded tag files.

pub mod generator;
pub mod replay;

use thiserror::Error;

pub use generator::{
    demo_measurement, GeneratorConfig, SyntheticClock, SyntheticSignal, TagGenerator,
};
pub use replay::TagReplay;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("jitter must be finite and non-negative, got {0} ps")]
    Jitter(f64),
    #[error("invalid noise distribution: {0}")]
    Distribution(#[from] rand_distr::NormalError),
    #[error("dropout probability must lie in [0, 1], got {0}")]
    Dropout(f64),
    #[error("generator period must be positive, got {0} ps")]
    Period(i64),
    #[error(transparent)]
    Config(#[from] pps_common::ConfigError),
}
