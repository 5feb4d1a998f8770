use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::source::MetricsCallback;

const NAMESPACE: &str = "trafficd";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "trafficd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Samplers ===
    /// Executed ticks by source.
    pub sampler_ticks: CounterVec,
    /// Failed ticks by source.
    pub sampler_errors: CounterVec,
    /// Rows written by source.
    pub sampler_rows_inserted: CounterVec,
    /// Tick duration by source.
    pub sampler_tick_duration: HistogramVec,
    /// Whether a sampler is paused (1=yes, 0=no).
    pub sampler_paused: GaugeVec,
    /// Identities or peers held in retained counter state, by source.
    pub retained_entries: GaugeVec,

    // === Attribution ===
    /// Aggregate bytes left unattributed, by reason (no_active_identity,
    /// split_remainder).
    pub attribution_dropped_bytes: CounterVec,
    /// Identities seen in the access log within the active window.
    pub attribution_active_identities: Gauge,

    // === Retention ===
    /// Raw rows removed by retention, by source and pass (delete/rollup).
    pub retention_rows_removed: CounterVec,

    // === Upstream sources ===
    /// Upstream requests by source and status.
    pub source_requests_total: CounterVec,
    /// Upstream request duration by source.
    pub source_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let sampler_ticks = CounterVec::new(
            Opts::new("sampler_ticks_total", "Total executed sampler ticks.").namespace(NAMESPACE),
            &["source"],
        )?;
        let sampler_errors = CounterVec::new(
            Opts::new("sampler_errors_total", "Total sampler ticks that failed.")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let sampler_rows_inserted = CounterVec::new(
            Opts::new(
                "sampler_rows_inserted_total",
                "Total rows written by samplers.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let sampler_tick_duration = HistogramVec::new(
            HistogramOpts::new(
                "sampler_tick_duration_seconds",
                "Time spent in one sampler tick.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["source"],
        )?;
        let sampler_paused = GaugeVec::new(
            Opts::new("sampler_paused", "Whether a sampler is paused (1=yes, 0=no).")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let retained_entries = GaugeVec::new(
            Opts::new(
                "retained_entries",
                "Entries held in in-memory counter state.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;

        let attribution_dropped_bytes = CounterVec::new(
            Opts::new(
                "attribution_dropped_bytes_total",
                "Aggregate bytes left unattributed, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let attribution_active_identities = Gauge::with_opts(
            Opts::new(
                "attribution_active_identities",
                "Identities seen in the access log within the active window.",
            )
            .namespace(NAMESPACE),
        )?;

        let retention_rows_removed = CounterVec::new(
            Opts::new(
                "retention_rows_removed_total",
                "Raw rows removed by retention passes.",
            )
            .namespace(NAMESPACE),
            &["source", "pass"],
        )?;

        let source_requests_total = CounterVec::new(
            Opts::new(
                "source_requests_total",
                "Upstream counter requests by source and status.",
            )
            .namespace(NAMESPACE),
            &["source", "status"],
        )?;
        let source_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "source_request_duration_seconds",
                "Upstream counter request duration.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0]),
            &["source"],
        )?;

        registry.register(Box::new(sampler_ticks.clone()))?;
        registry.register(Box::new(sampler_errors.clone()))?;
        registry.register(Box::new(sampler_rows_inserted.clone()))?;
        registry.register(Box::new(sampler_tick_duration.clone()))?;
        registry.register(Box::new(sampler_paused.clone()))?;
        registry.register(Box::new(retained_entries.clone()))?;
        registry.register(Box::new(attribution_dropped_bytes.clone()))?;
        registry.register(Box::new(attribution_active_identities.clone()))?;
        registry.register(Box::new(retention_rows_removed.clone()))?;
        registry.register(Box::new(source_requests_total.clone()))?;
        registry.register(Box::new(source_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            sampler_ticks,
            sampler_errors,
            sampler_rows_inserted,
            sampler_tick_duration,
            sampler_paused,
            retained_entries,
            attribution_dropped_bytes,
            attribution_active_identities,
            retention_rows_removed,
            source_requests_total,
            source_request_duration,
        })
    }

    /// Records the outcome of one executed sampler tick.
    pub fn observe_tick(&self, source: &str, duration: Duration, inserted: usize, failed: bool) {
        self.sampler_ticks.with_label_values(&[source]).inc();
        self.sampler_tick_duration
            .with_label_values(&[source])
            .observe(duration.as_secs_f64());
        self.sampler_rows_inserted
            .with_label_values(&[source])
            .inc_by(inserted as f64);
        if failed {
            self.sampler_errors.with_label_values(&[source]).inc();
        }
    }

    /// Records one upstream request.
    pub fn record_request(&self, source: &str, status: &str, duration: Duration) {
        self.source_requests_total
            .with_label_values(&[source, status])
            .inc();
        self.source_request_duration
            .with_label_values(&[source])
            .observe(duration.as_secs_f64());
    }

    /// Builds a source metrics callback feeding [`Self::record_request`].
    pub fn request_callback(self: &Arc<Self>) -> MetricsCallback {
        let health = Arc::clone(self);
        Box::new(move |source, status, duration| {
            health.record_request(source, status, duration);
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
