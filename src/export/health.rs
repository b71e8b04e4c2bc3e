use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "ioeye";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "ioeye" namespace. Grouped by pipeline stage:
/// event intake, correlation, aggregation cycles, and analysis results.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    // === Intake ===
    /// Total events received from the event source.
    pub events_received: Counter,
    /// Total events dropped because the collector channel was full.
    pub events_dropped: Counter,
    /// Event parse errors by error_type.
    pub event_parse_errors: CounterVec,
    /// Events received by probe kind.
    pub events_by_probe: CounterVec,
    /// Event source errors other than parse errors.
    pub source_errors: Counter,
    /// Collector channel capacity.
    pub event_channel_capacity: Gauge,

    // === Correlation ===
    /// Operations completed by stage.
    pub operations_completed: CounterVec,
    /// Completions with no pending start.
    pub completions_unmatched: Counter,
    /// Pending starts dropped after the horizon.
    pub starts_expired: Counter,
    /// Starts dropped because the pending table was full.
    pub starts_overflowed: Counter,
    /// Starts that replaced an earlier start with the same key.
    pub starts_replaced: Counter,
    /// Matched operations with no entity on either side.
    pub operations_unattributed: Counter,
    /// Matched operations whose completion preceded the start.
    pub operations_skewed: Counter,
    /// Starts awaiting completion.
    pub pending_starts: Gauge,

    // === Cycles ===
    /// Aggregation cycles applied.
    pub cycles_total: Counter,
    /// Aggregation cycles skipped after a directory failure.
    pub cycles_skipped: Counter,
    /// Aggregation plus analysis duration.
    pub cycle_duration: Histogram,
    /// Entity directory listing duration.
    pub directory_refresh_duration: Histogram,

    // === Analysis ===
    /// Entities with at least one snapshot.
    pub entities_tracked: Gauge,
    /// Entities whose latest snapshot is anomalous.
    pub anomalies_active: Gauge,
    /// Entities by bottleneck type.
    pub entities_by_bottleneck: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Intake ===
        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events received from the event source.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total events dropped because the collector channel was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let event_parse_errors = CounterVec::new(
            Opts::new(
                "event_parse_errors_total",
                "Total event parse errors by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let events_by_probe = CounterVec::new(
            Opts::new(
                "events_by_probe_total",
                "Total events received by probe kind.",
            )
            .namespace(NAMESPACE),
            &["probe"],
        )?;
        let source_errors = Counter::with_opts(
            Opts::new(
                "source_errors_total",
                "Total event source errors other than parse errors.",
            )
            .namespace(NAMESPACE),
        )?;
        let event_channel_capacity = Gauge::with_opts(
            Opts::new(
                "event_channel_capacity",
                "Capacity of the collector event channel.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Correlation ===
        let operations_completed = CounterVec::new(
            Opts::new(
                "operations_completed_total",
                "Total operations completed by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let completions_unmatched = Counter::with_opts(
            Opts::new(
                "completions_unmatched_total",
                "Total completions with no pending start.",
            )
            .namespace(NAMESPACE),
        )?;
        let starts_expired = Counter::with_opts(
            Opts::new(
                "starts_expired_total",
                "Total pending starts dropped after the horizon.",
            )
            .namespace(NAMESPACE),
        )?;
        let starts_overflowed = Counter::with_opts(
            Opts::new(
                "starts_overflowed_total",
                "Total starts dropped because the pending table was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let starts_replaced = Counter::with_opts(
            Opts::new(
                "starts_replaced_total",
                "Total starts that replaced an earlier start with the same key.",
            )
            .namespace(NAMESPACE),
        )?;
        let operations_unattributed = Counter::with_opts(
            Opts::new(
                "operations_unattributed_total",
                "Total matched operations with no entity.",
            )
            .namespace(NAMESPACE),
        )?;
        let operations_skewed = Counter::with_opts(
            Opts::new(
                "operations_skewed_total",
                "Total matched operations completing before their start.",
            )
            .namespace(NAMESPACE),
        )?;
        let pending_starts = Gauge::with_opts(
            Opts::new("pending_starts", "Starts awaiting completion.").namespace(NAMESPACE),
        )?;

        // === Cycles ===
        let cycles_total = Counter::with_opts(
            Opts::new("cycles_total", "Total aggregation cycles applied.").namespace(NAMESPACE),
        )?;
        let cycles_skipped = Counter::with_opts(
            Opts::new(
                "cycles_skipped_total",
                "Total aggregation cycles skipped after a directory failure.",
            )
            .namespace(NAMESPACE),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Time to aggregate and analyze one cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        let directory_refresh_duration = Histogram::with_opts(
            HistogramOpts::new(
                "directory_refresh_duration_seconds",
                "Time to list monitored entities.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        // === Analysis ===
        let entities_tracked = Gauge::with_opts(
            Opts::new("entities_tracked", "Entities with at least one snapshot.")
                .namespace(NAMESPACE),
        )?;
        let anomalies_active = Gauge::with_opts(
            Opts::new(
                "anomalies_active",
                "Entities whose latest snapshot is anomalous.",
            )
            .namespace(NAMESPACE),
        )?;
        let entities_by_bottleneck = GaugeVec::new(
            Opts::new("entities_by_bottleneck", "Entities by bottleneck type.")
                .namespace(NAMESPACE),
            &["bottleneck"],
        )?;

        // Register all metrics with the custom registry.
        // Intake
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(event_parse_errors.clone()))?;
        registry.register(Box::new(events_by_probe.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(event_channel_capacity.clone()))?;

        // Correlation
        registry.register(Box::new(operations_completed.clone()))?;
        registry.register(Box::new(completions_unmatched.clone()))?;
        registry.register(Box::new(starts_expired.clone()))?;
        registry.register(Box::new(starts_overflowed.clone()))?;
        registry.register(Box::new(starts_replaced.clone()))?;
        registry.register(Box::new(operations_unattributed.clone()))?;
        registry.register(Box::new(operations_skewed.clone()))?;
        registry.register(Box::new(pending_starts.clone()))?;

        // Cycles
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycles_skipped.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(directory_refresh_duration.clone()))?;

        // Analysis
        registry.register(Box::new(entities_tracked.clone()))?;
        registry.register(Box::new(anomalies_active.clone()))?;
        registry.register(Box::new(entities_by_bottleneck.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            event_parse_errors,
            events_by_probe,
            source_errors,
            event_channel_capacity,
            operations_completed,
            completions_unmatched,
            starts_expired,
            starts_overflowed,
            starts_replaced,
            operations_unattributed,
            operations_skewed,
            pending_starts,
            cycles_total,
            cycles_skipped,
            cycle_duration,
            directory_refresh_duration,
            entities_tracked,
            anomalies_active,
            entities_by_bottleneck,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
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

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Current metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
