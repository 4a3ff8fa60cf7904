//! ---
//! pps_section: "05-daemon"
//! pps_subsection: "binary"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Binary entrypoint for the tracking daemon."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pps_common::config::LoadedAppConfig;
use pps_common::time::{format_ps, ps_to_duration, ps_to_seconds};
use pps_common::{init_tracing, AppConfig, LoggingConfig, MetricsConfig, SCHEMA_VERSION};
use pps_core::{CycleRow, SharedResults, TagEvent, Tracker, TrackerError};
use pps_metrics::{new_registry, spawn_http_server};
use pps_sim::{demo_measurement, GeneratorConfig, TagGenerator, TagReplay};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/ppsd.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "PPS tracking daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RowFormat::Table, help = "Per-cycle output format")]
    format: RowFormat,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 5,
        help = "Interval between result buffer status logs"
    )]
    status_interval: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RowFormat {
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Feed a recorded tag file (.csv or .json) through the tracker")]
    Replay {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        #[arg(long, default_value_t = 4096)]
        batch_size: usize,
    },
    #[command(about = "Feed a seeded synthetic tag stream through the tracker")]
    Simulate {
        #[arg(long, default_value_t = 100, help = "Reference periods to generate")]
        cycles: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value_t = 0.0, help = "Tagger frequency error in ppm")]
        drift_ppm: f64,
        #[arg(long, help = "Sleep one reference period between batches")]
        paced: bool,
        #[arg(long, value_name = "FILE", help = "Also write the generated tags as CSV")]
        record: Option<PathBuf>,
    },
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

enum Source {
    Replay {
        replay: TagReplay,
        batch_size: usize,
    },
    Simulate {
        generator: TagGenerator,
        cycles: usize,
        pace: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let allow_demo = matches!(cli.command, Commands::Simulate { .. });
    let (config, source_path) = load_config(cli.config.as_deref(), allow_demo)?;
    init_tracing("ppsd", &config.logging)?;
    match &source_path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!("no configuration file found; using the built-in demo measurement"),
    }

    let source = match cli.command {
        Commands::CheckConfig => {
            config.validate()?;
            let rendered =
                toml::to_string_pretty(&config).context("unable to render configuration")?;
            println!("{rendered}");
            return Ok(());
        }
        Commands::Replay { input, batch_size } => Source::Replay {
            replay: TagReplay::from_path(&input)?,
            batch_size,
        },
        Commands::Simulate {
            cycles,
            seed,
            drift_ppm,
            paced,
            record,
        } => {
            let generator_config = GeneratorConfig::for_measurement(&config.measurement, seed)?
                .with_drift(drift_ppm);
            let mut generator = TagGenerator::new(generator_config)?;
            let pace = paced.then(|| ps_to_duration(generator.config().period_ps));
            match record {
                Some(path) => {
                    let tags = generator.take_cycles(cycles);
                    TagReplay::write_csv(&path, &tags)?;
                    info!(path = %path.display(), tags = tags.len(), "synthetic stream recorded");
                    Source::Replay {
                        replay: TagReplay::from_tags(tags),
                        batch_size: 4096,
                    }
                }
                None => Source::Simulate {
                    generator,
                    cycles,
                    pace,
                },
            }
        }
    };

    run(
        config,
        source,
        cli.format,
        Duration::from_secs(cli.status_interval.max(1)),
    )
    .await
}

fn load_config(path: Option<&Path>, allow_demo: bool) -> Result<(AppConfig, Option<PathBuf>)> {
    let mut candidates = Vec::new();
    if let Some(path) = path {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    match AppConfig::load_with_source(&candidates) {
        Ok(LoadedAppConfig { config, source }) => Ok((config, Some(source))),
        Err(_) if allow_demo && path.is_none() => Ok((
            AppConfig {
                version: SCHEMA_VERSION,
                measurement: demo_measurement(),
                logging: LoggingConfig::default(),
                metrics: MetricsConfig::default(),
            },
            None,
        )),
        Err(err) => Err(err),
    }
}

async fn run(
    config: AppConfig,
    source: Source,
    format: RowFormat,
    status_interval: Duration,
) -> Result<()> {
    let mut tracker = Tracker::new(&config.measurement)?;
    let metrics_server = if config.metrics.enabled {
        let registry = new_registry();
        tracker = tracker.with_registry(registry.clone())?;
        let server = spawn_http_server(registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let shutdown = tracker.shutdown_handle();
    let results = tracker.results();
    let names: Vec<String> = config
        .measurement
        .signals
        .iter()
        .map(|signal| signal.display_name())
        .collect();

    let watcher = tokio::spawn(watch_results(results.clone(), status_interval));
    let stopper = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; stopping tracker");
            shutdown.stop();
        }
    });

    let worker = tokio::task::spawn_blocking(move || drive(tracker, source, format, &names));
    let outcome = worker.await.context("tracker worker panicked")?;
    stopper.abort();
    watcher.abort();

    let processed = outcome?;
    info!(
        tags = processed,
        cycles = results.completed_cycles(),
        "measurement finished"
    );

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Run batches until the source is exhausted or the tracker is stopped.
fn drive(
    mut tracker: Tracker,
    source: Source,
    format: RowFormat,
    names: &[String],
) -> Result<u64> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut step = |tracker: &mut Tracker, batch: &[TagEvent]| -> Result<bool> {
        match tracker.process_batch(batch) {
            Ok(report) => {
                for row in &report.rows {
                    write_row(&mut out, row, format, names)?;
                }
                Ok(true)
            }
            Err(TrackerError::Stopped) => {
                info!("tracker stopped; remaining input discarded");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    };

    match source {
        Source::Replay { replay, batch_size } => {
            for batch in replay.batches(batch_size) {
                if !step(&mut tracker, batch)? {
                    break;
                }
            }
        }
        Source::Simulate {
            mut generator,
            cycles,
            pace,
        } => {
            for _ in 0..cycles {
                let batch = generator.next_batch();
                if !step(&mut tracker, &batch)? {
                    break;
                }
                if let Some(pace) = pace {
                    std::thread::sleep(pace);
                }
            }
        }
    }
    Ok(tracker.tags_processed())
}

fn write_row(
    out: &mut impl Write,
    row: &CycleRow,
    format: RowFormat,
    names: &[String],
) -> Result<()> {
    match format {
        RowFormat::Json => {
            serde_json::to_writer(&mut *out, row)?;
            writeln!(out)?;
        }
        RowFormat::Table => {
            write!(
                out,
                "cycle {:>6} @ {:>14.6} s",
                row.cycle_index,
                ps_to_seconds(row.reference_time)
            )?;
            for (stats, name) in row.channels.iter().zip(names) {
                write!(
                    out,
                    " | {name}: {} +/- {}",
                    format_ps(stats.mean),
                    format_ps(stats.stddev)
                )?;
            }
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}

async fn watch_results(results: SharedResults, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let mut seen = 0;
    loop {
        ticker.tick().await;
        if let Some(snapshot) = results.snapshot_if_newer(seen) {
            seen = snapshot.completed_cycles;
            info!(
                completed_cycles = snapshot.completed_cycles,
                buffered_rows = snapshot.len(),
                "result buffer updated"
            );
        }
    }
}
