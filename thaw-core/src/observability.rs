/*!
Observability infrastructure for Thaw.

- Structured logging setup (JSON or human-readable) through `tracing-subscriber`
- Optional Prometheus counters for the flush and restore paths (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, ThawError};

/// Global metrics instance; `None` when registration failed at startup
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<ThawMetrics>> = OnceLock::new();

/// Metrics collection for the snapshot pipeline
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct ThawMetrics {
    pub flushes_total: Counter,
    pub flush_failures_total: Counter,
    pub flush_latency_seconds: Histogram,
    pub snapshot_size_bytes: Histogram,
    pub restores_total: Counter,
    pub restore_failures_total: Counter,
    pub staged_events_total: Counter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl ThawMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help)
                .map_err(|e| ThawError::storage(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| ThawError::storage(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };
        let flushes_total = counter("thaw_flushes_total", "Snapshots uploaded successfully")?;
        let flush_failures_total =
            counter("thaw_flush_failures_total", "Snapshot uploads that failed")?;
        let restores_total = counter("thaw_restores_total", "Snapshots restored on startup")?;
        let restore_failures_total =
            counter("thaw_restore_failures_total", "Restores that found nothing or failed")?;
        let staged_events_total =
            counter("thaw_staged_events_total", "File changes copied into the staging buffer")?;

        let histogram = |opts: HistogramOpts| -> Result<Histogram> {
            let name = opts.common_opts.name.clone();
            let histogram = Histogram::with_opts(opts)
                .map_err(|e| ThawError::storage(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(histogram.clone()))
                .map_err(|e| ThawError::storage(format!("Failed to register {name}: {e}")))?;
            Ok(histogram)
        };
        let flush_latency_seconds = histogram(HistogramOpts::new(
            "thaw_flush_latency_seconds",
            "Duration of drain, encode and upload",
        ))?;
        let snapshot_size_bytes = histogram(
            HistogramOpts::new("thaw_snapshot_size_bytes", "Size of uploaded snapshots")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).map_err(|e| {
                    ThawError::storage(format!("Invalid snapshot size buckets: {e}"))
                })?),
        )?;

        Ok(Self {
            flushes_total,
            flush_failures_total,
            flush_latency_seconds,
            snapshot_size_bytes,
            restores_total,
            restore_failures_total,
            staged_events_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static ThawMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ThawError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| ThawError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Run `f` against the global metrics, if they are available
#[cfg(feature = "metrics")]
pub(crate) fn record(f: impl FnOnce(&ThawMetrics)) {
    if let Some(metrics) = ThawMetrics::global() {
        f(metrics);
    }
}

/// Measures one flush from drain to upload
#[cfg(feature = "metrics")]
pub(crate) struct FlushTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl FlushTimer {
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn finish(self, snapshot_bytes: usize) {
        let elapsed = self.start.elapsed();
        record(|m| {
            m.flushes_total.inc();
            m.flush_latency_seconds.observe(elapsed.as_secs_f64());
            m.snapshot_size_bytes.observe(snapshot_bytes as f64);
        });
    }

    pub(crate) fn finish_with_error(self) {
        let elapsed = self.start.elapsed();
        record(|m| {
            m.flush_failures_total.inc();
            m.flush_latency_seconds.observe(elapsed.as_secs_f64());
        });
    }
}

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log collectors
    #[default]
    Json,
    /// Human-readable lines
    Pretty,
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` is honoured when set; the crate's own targets are raised to `info`
/// (or `debug` when `verbose`).
///
/// # Errors
/// Fails when a global subscriber was already installed.
pub fn init_observability(format: LogFormat, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    ThawMetrics::global();

    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    for target in ["thaw_core", "thawd"] {
        let directive = format!("{target}={level}")
            .parse()
            .map_err(|e| ThawError::validation(format!("Invalid log directive: {e}")))?;
        filter = filter.add_directive(directive);
    }

    let json_layer = (format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
    });
    let pretty_layer =
        (format == LogFormat::Pretty).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer);

    set_global_default(subscriber).map_err(|e| {
        ThawError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(?format, "Thaw observability initialized");
    Ok(())
}

/// Initialize observability with default settings
pub fn init_default_observability() -> Result<()> {
    init_observability(LogFormat::default(), false)
}
