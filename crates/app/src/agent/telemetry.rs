//! Tracing subscriber, Prometheus exporter, and thread spawning that keeps
//! the active dispatcher.

use std::{fs::File, io, net::SocketAddr, path::Path, sync::OnceLock, thread};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

static METRICS_INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Keeps the Chrome trace writer alive; the trace file is flushed on drop.
#[must_use]
pub struct TelemetryGuard {
    _chrome: Option<FlushGuard>,
}

/// Install the global tracing subscriber. Safe to call more than once; later
/// calls are ignored.
///
/// With `chrome_trace` set, spans are also written to that file in Chrome's
/// trace event format (load it in `chrome://tracing` or Perfetto).
pub fn init(verbose: bool, chrome_trace: Option<&Path>) -> TelemetryGuard {
    let default_filter = if verbose {
        "info,fire_agent=debug,video_ingest=debug,ml_core=debug"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (chrome_layer, chrome_guard) = match chrome_trace.map(File::create) {
        Some(Ok(file)) => {
            let (layer, guard) = ChromeLayerBuilder::new()
                .writer(file)
                .include_args(true)
                .trace_style(TraceStyle::Threaded)
                .build();
            let spans_only = filter_fn(|metadata| metadata.is_span());
            (Some(layer.with_filter(spans_only)), Some(guard))
        }
        Some(Err(err)) => {
            eprintln!("Failed to create Chrome trace file: {err}");
            (None, None)
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(chrome_layer)
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init();

    if let Some(path) = chrome_trace.filter(|_| chrome_guard.is_some()) {
        tracing::info!("Writing Chrome trace to {}", path.display());
    }
    TelemetryGuard {
        _chrome: chrome_guard,
    }
}

/// Install the Prometheus recorder and its HTTP listener once per process.
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    if let Some(existing) = METRICS_INSTALLED.get() {
        tracing::debug!("Metrics exporter already listening on {existing}");
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics exporter on {addr}"))?;
    let _ = METRICS_INSTALLED.set(addr);
    tracing::info!("Prometheus metrics available at http://{addr}/metrics");
    Ok(())
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
