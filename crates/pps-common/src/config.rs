//! ---
//! pps_section: "01-core-functionality"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Versioned configuration schema for the tracking runtime."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;
use crate::time::PS_PER_SECOND;

/// Schema version understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Structural problems that make a measurement impossible to start.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported configuration schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("no reference channel configured")]
    MissingReference,
    #[error("reference period must be positive, got {0} ps")]
    NonPositivePeriod(i64),
    #[error("average count must be at least 1")]
    ZeroAverageCount,
    #[error("at least one signal channel is required")]
    NoSignalChannels,
    #[error("channel {0} is assigned more than one role")]
    DuplicateChannel(i32),
    #[error("clock period must be positive, got {0} ps")]
    NonPositiveClockPeriod(i64),
    #[error("clock fit window must hold at least 2 ticks, got {0}")]
    ClockWindowTooSmall(usize),
    #[error("buffer `{0}` must have a non-zero capacity")]
    ZeroCapacity(&'static str),
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

fn default_period_ps() -> i64 {
    PS_PER_SECOND
}

fn default_average_count() -> u32 {
    1
}

fn default_reference_name() -> String {
    "Reference".to_owned()
}

fn default_clock_window() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_wrap_anchor() -> bool {
    true
}

fn default_no_signal_threshold() -> Duration {
    Duration::from_secs(5)
}

fn default_pending_tags() -> usize {
    100
}

fn default_rescale_queue() -> usize {
    1000
}

fn default_results() -> usize {
    300
}

fn default_messages() -> usize {
    1000
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Top-level configuration object for the tracking daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "PPS_CONFIG";

    /// Load configuration from disk, respecting the `PPS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate the schema version and every measurement invariant.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                expected: SCHEMA_VERSION,
            });
        }
        self.measurement.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// How a matched tag is recorded into its channel histogram.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetMode {
    /// Offset of the tag from the previous reference tag.
    #[default]
    Absolute,
    /// Offset from the channel anchor established at acquisition.
    Relative,
}

/// Everything the correlation core needs for one measurement run.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default)]
    pub reference: Option<ReferenceConfig>,
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
    #[serde(default)]
    pub clock: Option<ClockConfig>,
    #[serde(default)]
    pub offset_mode: OffsetMode,
    #[serde(default = "default_wrap_anchor")]
    pub wrap_anchor: bool,
    #[serde(default = "default_no_signal_threshold")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub no_signal_threshold: Duration,
    #[serde(default)]
    pub buffers: BufferConfig,
}

impl MeasurementConfig {
    /// Convenience constructor used by tests and the simulator.
    pub fn new(reference: ReferenceConfig, signals: Vec<SignalConfig>) -> Self {
        Self {
            reference: Some(reference),
            signals,
            clock: None,
            offset_mode: OffsetMode::default(),
            wrap_anchor: default_wrap_anchor(),
            no_signal_threshold: default_no_signal_threshold(),
            buffers: BufferConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: ClockConfig) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The reference section, or [`ConfigError::MissingReference`].
    pub fn reference(&self) -> std::result::Result<&ReferenceConfig, ConfigError> {
        self.reference.as_ref().ok_or(ConfigError::MissingReference)
    }

    /// Samples kept per channel histogram, defaulting to `average_count + 10`.
    pub fn histogram_capacity(&self) -> usize {
        self.buffers.histogram.unwrap_or_else(|| {
            self.reference
                .as_ref()
                .map(|r| r.average_count as usize + 10)
                .unwrap_or(10)
        })
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let reference = self.reference()?;
        if reference.period_ps <= 0 {
            return Err(ConfigError::NonPositivePeriod(reference.period_ps));
        }
        if reference.average_count == 0 {
            return Err(ConfigError::ZeroAverageCount);
        }
        if self.signals.is_empty() {
            return Err(ConfigError::NoSignalChannels);
        }

        let mut seen = HashSet::new();
        seen.insert(reference.channel);
        if let Some(clock) = &self.clock {
            if !seen.insert(clock.channel) {
                return Err(ConfigError::DuplicateChannel(clock.channel));
            }
            if clock.period_ps <= 0 {
                return Err(ConfigError::NonPositiveClockPeriod(clock.period_ps));
            }
            if clock.window < 2 {
                return Err(ConfigError::ClockWindowTooSmall(clock.window));
            }
        }
        for signal in &self.signals {
            if !seen.insert(signal.channel) {
                return Err(ConfigError::DuplicateChannel(signal.channel));
            }
        }

        self.buffers.validate()?;
        if self.histogram_capacity() == 0 {
            return Err(ConfigError::ZeroCapacity("histogram"));
        }
        Ok(())
    }
}

/// Channel whose arrivals define cycle boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub channel: i32,
    #[serde(default = "default_reference_name")]
    pub name: String,
    #[serde(default = "default_period_ps")]
    pub period_ps: i64,
    #[serde(default = "default_average_count")]
    pub average_count: u32,
}

impl ReferenceConfig {
    pub fn new(channel: i32, period_ps: i64, average_count: u32) -> Self {
        Self {
            channel,
            name: default_reference_name(),
            period_ps,
            average_count,
        }
    }
}

/// A monitored signal input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub channel: i32,
    #[serde(default)]
    pub name: Option<String>,
}

impl SignalConfig {
    pub fn new(channel: i32) -> Self {
        Self {
            channel,
            name: None,
        }
    }

    /// Display name, `Channel <n>` when none was configured.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("Channel {}", self.channel),
        }
    }
}

/// External clock used to correct drift of every other channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub channel: i32,
    pub period_ps: i64,
    #[serde(default = "default_clock_window")]
    pub window: usize,
}

impl ClockConfig {
    pub fn new(channel: i32, period_ps: i64) -> Self {
        Self {
            channel,
            period_ps,
            window: default_clock_window(),
        }
    }

    /// Build from a clock frequency and an input divider.
    pub fn from_frequency(channel: i32, frequency_hz: f64, divider: u32) -> Self {
        let period_ps = (PS_PER_SECOND as f64 * f64::from(divider.max(1)) / frequency_hz).round();
        Self::new(channel, period_ps as i64)
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }
}

/// Fixed capacities of every ring allocated at measurement start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_pending_tags")]
    pub pending_tags: usize,
    #[serde(default)]
    pub histogram: Option<usize>,
    #[serde(default = "default_rescale_queue")]
    pub rescale_queue: usize,
    #[serde(default = "default_results")]
    pub results: usize,
    #[serde(default = "default_messages")]
    pub messages: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pending_tags: default_pending_tags(),
            histogram: None,
            rescale_queue: default_rescale_queue(),
            results: default_results(),
            messages: default_messages(),
        }
    }
}

impl BufferConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let capacities = [
            ("pending_tags", self.pending_tags),
            ("rescale_queue", self.rescale_queue),
            ("results", self.results),
            ("messages", self.messages),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Write the rolling JSON file next to the console output.
    #[serde(default = "default_true")]
    pub file: bool,
    /// Filter directive used when neither `PPS_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file: true,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
