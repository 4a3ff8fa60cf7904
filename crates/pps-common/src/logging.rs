//! ---
//! pps_section: "01-core-functionality"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Tracing subscriber setup for the tracking daemon."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PPS_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static CONSOLE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Install the global subscriber for `service_name`.
///
/// The filter is taken from `PPS_LOG`, then `RUST_LOG`, then `config.filter`,
/// then `info`; an unparsable directive is reported on stderr and skipped.
/// Console output goes to stderr so per-cycle rows on stdout stay clean.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (filter, filter_source) = resolve_filter(config);

    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(console_guard);

    let file_writer = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (writer, guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        let _ = FILE_GUARD.set(guard);
        Some(writer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(config.format, console_writer))
        .with(file_writer.map(file_layer))
        .try_init()
        .ok();

    info!(
        service = %service_name,
        filter = filter_source,
        format = ?config.format,
        log_dir = %config.directory.display(),
        file = config.file,
        "tracing initialised"
    );
    Ok(())
}

/// Install a plain console subscriber for tests and one-off tools.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

fn resolve_filter(config: &LoggingConfig) -> (EnvFilter, &'static str) {
    for var in [LOG_ENV, "RUST_LOG"] {
        if let Ok(directive) = std::env::var(var) {
            match EnvFilter::try_new(&directive) {
                Ok(filter) => return (filter, var),
                Err(err) => eprintln!("ignoring invalid {var} directive {directive:?}: {err}"),
            }
        }
    }
    if let Some(directive) = config.filter.as_deref() {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return (filter, "config"),
            Err(err) => eprintln!("ignoring invalid logging.filter {directive:?}: {err}"),
        }
    }
    (EnvFilter::new(DEFAULT_DIRECTIVE), "default")
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

fn file_layer<S>(writer: NonBlocking) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(writer)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_format_uses_kebab_case() {
        #[derive(Deserialize)]
        struct Holder {
            format: LogFormat,
        }
        let holder: Holder = toml::from_str(r#"format = "structured-json""#).unwrap();
        assert_eq!(holder.format, LogFormat::StructuredJson);
    }

    #[test]
    fn config_filter_applies_without_environment() {
        if std::env::var_os(LOG_ENV).is_some() || std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: Some("pps_core=debug".to_owned()),
            ..LoggingConfig::default()
        };
        assert_eq!(resolve_filter(&config).1, "config");

        let broken = LoggingConfig {
            filter: Some("pps_core=verbose".to_owned()),
            ..LoggingConfig::default()
        };
        assert_eq!(resolve_filter(&broken).1, "default");
    }

    #[test]
    fn init_creates_log_directory() {
        let dir = tempdir().unwrap();
        let config = LoggingConfig {
            directory: dir.path().join("logs"),
            ..LoggingConfig::default()
        };
        init_tracing("ppsd-test", &config).unwrap();
        assert!(config.directory.is_dir());
    }
}
