//! ---
//! pps_section: "03-observability"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Metrics collection and export utilities."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address (resolves port 0 to the real port).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters published by the tracking core.
#[derive(Clone)]
pub struct TrackerMetrics {
    registry: SharedRegistry,
    tags_processed: IntCounter,
    cycles_completed: IntCounter,
    samples_dropped: IntCounterVec,
    degenerate_fits: IntCounter,
    missing_channel_data: IntCounterVec,
    clock_overflows: IntCounter,
    anchored_channels: IntGauge,
}

impl TrackerMetrics {
    pub fn new(registry: SharedRegistry) -> prometheus::Result<Self> {
        let tags_processed = IntCounter::with_opts(Opts::new(
            "pps_tags_processed_total",
            "Total number of time tags consumed by the tracker",
        ))?;
        registry.register(Box::new(tags_processed.clone()))?;

        let cycles_completed = IntCounter::with_opts(Opts::new(
            "pps_cycles_completed_total",
            "Number of averaging cycles reduced into the result buffer",
        ))?;
        registry.register(Box::new(cycles_completed.clone()))?;

        let samples_dropped = IntCounterVec::new(
            Opts::new(
                "pps_samples_dropped_total",
                "Samples evicted from a full ring buffer, by buffer and channel",
            ),
            &["buffer", "channel"],
        )?;
        registry.register(Box::new(samples_dropped.clone()))?;

        let degenerate_fits = IntCounter::with_opts(Opts::new(
            "pps_degenerate_fits_total",
            "Tags passed through unrescaled because the clock interval was not positive",
        ))?;
        registry.register(Box::new(degenerate_fits.clone()))?;

        let missing_channel_data = IntCounterVec::new(
            Opts::new(
                "pps_missing_channel_data_total",
                "Cycles closed without a single sample for the channel",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(missing_channel_data.clone()))?;

        let clock_overflows = IntCounter::with_opts(Opts::new(
            "pps_clock_overflows_total",
            "Missed-event markers seen on the clock channel",
        ))?;
        registry.register(Box::new(clock_overflows.clone()))?;

        let anchored_channels = IntGauge::with_opts(Opts::new(
            "pps_anchored_channels",
            "Signal channels currently holding an anchor",
        ))?;
        registry.register(Box::new(anchored_channels.clone()))?;

        Ok(Self {
            registry,
            tags_processed,
            cycles_completed,
            samples_dropped,
            degenerate_fits,
            missing_channel_data,
            clock_overflows,
            anchored_channels,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn add_tags(&self, count: usize) {
        self.tags_processed.inc_by(count as u64);
    }

    pub fn add_cycles(&self, cycles: u64) {
        self.cycles_completed.inc_by(cycles);
    }

    pub fn record_dropped(&self, buffer: &str, channel: i32, dropped: u64) {
        self.samples_dropped
            .with_label_values(&[buffer, &channel.to_string()])
            .inc_by(dropped);
    }

    pub fn record_degenerate(&self, tags: u64) {
        self.degenerate_fits.inc_by(tags);
    }

    pub fn record_missing(&self, channel: i32, cycles: u64) {
        self.missing_channel_data
            .with_label_values(&[&channel.to_string()])
            .inc_by(cycles);
    }

    pub fn inc_clock_overflows(&self) {
        self.clock_overflows.inc();
    }

    pub fn set_anchored(&self, channels: usize) {
        self.anchored_channels.set(channels as i64);
    }
}

impl std::fmt::Debug for TrackerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
