//! ---
//! pps_section: "04-simulation"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Seeded generator of reference, signal and clock tag streams."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
//! Synthetic tag streams.
//!
//! Events are laid out on an ideal time axis (the external clock lattice)
//! and then converted to tagger time with a constant frequency error of
//! `drift_ppm`, which is what the clock rescaler is meant to remove.

use rand::prelude::*;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pps_common::{ClockConfig, MeasurementConfig, ReferenceConfig, SignalConfig};
use pps_core::TagEvent;

use crate::SimError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSignal {
    pub channel: i32,
    /// Offset after each reference pulse, ideal time.
    pub offset_ps: i64,
    pub jitter_ps: f64,
    /// Probability that a pulse is not emitted.
    #[serde(default)]
    pub dropout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticClock {
    pub channel: i32,
    pub period_ps: i64,
    pub jitter_ps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub reference_channel: i32,
    pub period_ps: i64,
    #[serde(default)]
    pub reference_jitter_ps: f64,
    /// Tagger frequency error relative to the external clock.
    #[serde(default)]
    pub drift_ppm: f64,
    pub signals: Vec<SyntheticSignal>,
    #[serde(default)]
    pub clock: Option<SyntheticClock>,
    pub seed: u64,
}

impl GeneratorConfig {
    /// Derive a source matching `measurement`: signal offsets are spread
    /// over the first half of the period.
    pub fn for_measurement(measurement: &MeasurementConfig, seed: u64) -> Result<Self, SimError> {
        let reference = measurement.reference()?;
        let fraction = reference.period_ps / (2 * (measurement.signals.len() as i64 + 1));
        let signals = measurement
            .signals
            .iter()
            .enumerate()
            .map(|(index, signal)| SyntheticSignal {
                channel: signal.channel,
                offset_ps: fraction * (index as i64 + 1),
                jitter_ps: 50.0,
                dropout: 0.0,
            })
            .collect();
        Ok(Self {
            reference_channel: reference.channel,
            period_ps: reference.period_ps,
            reference_jitter_ps: 0.0,
            drift_ppm: 0.0,
            signals,
            clock: measurement.clock.as_ref().map(|clock| SyntheticClock {
                channel: clock.channel,
                period_ps: clock.period_ps,
                jitter_ps: 10.0,
            }),
            seed,
        })
    }

    pub fn with_drift(mut self, drift_ppm: f64) -> Self {
        self.drift_ppm = drift_ppm;
        self
    }
}

/// Measurement used by the daemon when no configuration file is present:
/// a 100 Hz reference, two signals and a 10 kHz clock.
pub fn demo_measurement() -> MeasurementConfig {
    let mut measurement = MeasurementConfig::new(
        ReferenceConfig::new(1, 10_000_000_000, 10),
        vec![SignalConfig::new(2), SignalConfig::new(3)],
    )
    // 10 MHz reference divided down to 10 kHz ticks.
    .with_clock(ClockConfig::from_frequency(4, 10e6, 1_000).with_window(200));
    measurement.signals[0].name = Some("PPS A".to_owned());
    measurement.signals[1].name = Some("PPS B".to_owned());
    measurement
}

#[derive(Debug)]
pub struct TagGenerator {
    config: GeneratorConfig,
    rng: StdRng,
    reference_noise: Normal<f64>,
    signal_noise: Vec<Normal<f64>>,
    clock_noise: Option<Normal<f64>>,
    cycle: i64,
    next_tick: i64,
}

/// Zero-mean noise with standard deviation `jitter_ps`.
fn gaussian(jitter_ps: f64) -> Result<Normal<f64>, SimError> {
    if !(jitter_ps.is_finite() && jitter_ps >= 0.0) {
        return Err(SimError::Jitter(jitter_ps));
    }
    Ok(Normal::new(0.0, jitter_ps)?)
}

impl TagGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, SimError> {
        if config.period_ps <= 0 {
            return Err(SimError::Period(config.period_ps));
        }
        if let Some(clock) = &config.clock {
            if clock.period_ps <= 0 {
                return Err(SimError::Period(clock.period_ps));
            }
        }
        let signal_noise = config
            .signals
            .iter()
            .map(|signal| {
                if !(0.0..=1.0).contains(&signal.dropout) {
                    return Err(SimError::Dropout(signal.dropout));
                }
                gaussian(signal.jitter_ps)
            })
            .collect::<Result<Vec<_>, SimError>>()?;
        let clock_noise = config
            .clock
            .as_ref()
            .map(|clock| gaussian(clock.jitter_ps))
            .transpose()?;
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            reference_noise: gaussian(config.reference_jitter_ps)?,
            signal_noise,
            clock_noise,
            cycle: 0,
            next_tick: 0,
            config,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Reference periods generated so far.
    pub fn cycle(&self) -> i64 {
        self.cycle
    }

    fn to_tagger_time(&self, ideal: f64) -> i64 {
        (ideal * (1.0 + self.config.drift_ppm * 1e-6)).round() as i64
    }

    /// Tags of the next reference period in tagger-time order.
    pub fn next_batch(&mut self) -> Vec<TagEvent> {
        let period = self.config.period_ps;
        let start = self.cycle * period;
        let end = start + period;
        let mut tags = Vec::with_capacity(self.config.signals.len() + 1);

        let reference = start as f64 + self.reference_noise.sample(&mut self.rng);
        tags.push(TagEvent::normal(
            self.config.reference_channel,
            self.to_tagger_time(reference),
        ));

        for index in 0..self.config.signals.len() {
            let (channel, offset, dropout) = {
                let signal = &self.config.signals[index];
                (signal.channel, signal.offset_ps, signal.dropout)
            };
            if dropout > 0.0 && self.rng.gen_bool(dropout) {
                continue;
            }
            let ideal = (start + offset) as f64 + self.signal_noise[index].sample(&mut self.rng);
            tags.push(TagEvent::normal(channel, self.to_tagger_time(ideal)));
        }

        if let (Some(clock), Some(noise)) = (&self.config.clock, &self.clock_noise) {
            let (channel, tick_period) = (clock.channel, clock.period_ps);
            while self.next_tick * tick_period < end {
                let ideal = (self.next_tick * tick_period) as f64 + noise.sample(&mut self.rng);
                tags.push(TagEvent::normal(channel, self.to_tagger_time(ideal)));
                self.next_tick += 1;
            }
        }

        tags.sort_by_key(|tag| tag.time);
        self.cycle += 1;
        debug!(cycle = self.cycle, tags = tags.len(), "synthetic batch generated");
        tags
    }

    /// Next `count` periods as one flat stream.
    pub fn take_cycles(&mut self, count: usize) -> Vec<TagEvent> {
        (0..count).flat_map(|_| self.next_batch()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeneratorConfig {
        GeneratorConfig {
            reference_channel: 1,
            period_ps: 1_000_000,
            reference_jitter_ps: 0.0,
            drift_ppm: 0.0,
            signals: vec![SyntheticSignal {
                channel: 2,
                offset_ps: 250_000,
                jitter_ps: 5.0,
                dropout: 0.0,
            }],
            clock: Some(SyntheticClock {
                channel: 3,
                period_ps: 100_000,
                jitter_ps: 0.0,
            }),
            seed: 7,
        }
    }

    #[test]
    fn batches_cover_one_period_in_order() {
        let mut generator = TagGenerator::new(config()).unwrap();
        let first = generator.next_batch();
        assert_eq!(first.len(), 1 + 1 + 10);
        assert!(first.windows(2).all(|pair| pair[0].time <= pair[1].time));
        let second = generator.next_batch();
        assert_eq!(second.iter().filter(|tag| tag.channel == 3).count(), 10);
        assert_eq!(second[0].time, 1_000_000);
        assert_eq!(generator.cycle(), 2);
    }

    #[test]
    fn same_seed_reproduces_stream() {
        let a = TagGenerator::new(config()).unwrap().take_cycles(5);
        let b = TagGenerator::new(config()).unwrap().take_cycles(5);
        assert_eq!(a, b);
    }

    #[test]
    fn drift_stretches_tagger_time() {
        let mut generator = TagGenerator::new(config().with_drift(100.0)).unwrap();
        generator.next_batch();
        let batch = generator.next_batch();
        let reference = batch.iter().find(|tag| tag.channel == 1).unwrap();
        assert_eq!(reference.time, 1_000_100);
    }

    #[test]
    fn full_dropout_silences_a_channel() {
        let mut config = config();
        config.signals[0].dropout = 1.0;
        let tags = TagGenerator::new(config).unwrap().take_cycles(4);
        assert!(tags.iter().all(|tag| tag.channel != 2));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut bad_jitter = config();
        bad_jitter.signals[0].jitter_ps = -1.0;
        assert!(matches!(TagGenerator::new(bad_jitter), Err(SimError::Jitter(j)) if j == -1.0));

        let mut bad_reference = config();
        bad_reference.reference_jitter_ps = f64::NAN;
        assert!(matches!(TagGenerator::new(bad_reference), Err(SimError::Jitter(_))));

        let mut bad_clock = config();
        bad_clock.clock.as_mut().unwrap().jitter_ps = f64::INFINITY;
        assert!(matches!(TagGenerator::new(bad_clock), Err(SimError::Jitter(_))));

        let mut bad_dropout = config();
        bad_dropout.signals[0].dropout = 1.5;
        assert!(matches!(TagGenerator::new(bad_dropout), Err(SimError::Dropout(_))));
    }

    #[test]
    fn derived_source_matches_measurement() {
        let measurement = demo_measurement();
        let config = GeneratorConfig::for_measurement(&measurement, 1).unwrap();
        assert_eq!(config.reference_channel, 1);
        assert_eq!(config.signals.len(), 2);
        assert!(config.signals.iter().all(|s| s.offset_ps < config.period_ps / 2));
        assert_eq!(config.clock.map(|c| c.channel), Some(4));
        assert_eq!(measurement.clock.as_ref().map(|c| c.period_ps), Some(100_000_000));
        assert!(measurement.validate().is_ok());
    }
}
