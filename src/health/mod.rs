use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for the ingestion pipeline.
///
/// All metrics use the "sitepulse" namespace, grouped by the component that
/// records them.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingress ===
    /// Submit outcomes (accepted/invalid/queue_error).
    pub ingress_requests: CounterVec,
    /// Time spent waiting for the log to confirm an append.
    pub append_duration: Histogram,

    // === Processor ===
    /// Messages fetched from the log (including redeliveries).
    pub events_fetched: Counter,
    /// Payloads dropped because they could not be decoded, by error type.
    pub decode_errors: CounterVec,
    /// Events successfully written to the store.
    pub events_persisted: Counter,
    /// Store writes that failed and left the offset uncommitted.
    pub persist_errors: Counter,
    /// Rewinds issued to re-deliver a failed message.
    pub rewinds: Counter,
    /// Fetch and rewind failures from the log.
    pub fetch_errors: Counter,
    /// Offset commits that failed after a successful persist.
    pub commit_errors: Counter,
    /// Last committed offset per partition.
    pub committed_offset: GaugeVec,
    /// Processor loops currently running.
    pub processors_running: Gauge,

    // === Store ===
    /// Store call duration by operation.
    pub store_duration: HistogramVec,
    /// Whether the ClickHouse pool answered its startup ping (1=yes, 0=no).
    pub clickhouse_connected: Gauge,

    // === Reporting ===
    /// Stats endpoint responses by status.
    pub stats_requests: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingress ===
        let ingress_requests = CounterVec::new(
            Opts::new(
                "ingress_requests_total",
                "Total event submissions by outcome.",
            )
            .namespace("sitepulse"),
            &["outcome"],
        )?;
        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "append_duration_seconds",
                "Time to append an event to the durable log.",
            )
            .namespace("sitepulse")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        // === Processor ===
        let events_fetched = Counter::with_opts(
            Opts::new(
                "events_fetched_total",
                "Total messages fetched from the durable log.",
            )
            .namespace("sitepulse"),
        )?;
        let decode_errors = CounterVec::new(
            Opts::new(
                "decode_errors_total",
                "Total queued payloads dropped as undecodable by error type.",
            )
            .namespace("sitepulse"),
            &["error_type"],
        )?;
        let events_persisted = Counter::with_opts(
            Opts::new("events_persisted_total", "Total events written to the store.")
                .namespace("sitepulse"),
        )?;
        let persist_errors = Counter::with_opts(
            Opts::new(
                "persist_errors_total",
                "Total store writes that failed and were left uncommitted.",
            )
            .namespace("sitepulse"),
        )?;
        let rewinds = Counter::with_opts(
            Opts::new(
                "rewinds_total",
                "Total rewinds issued to re-deliver a message.",
            )
            .namespace("sitepulse"),
        )?;
        let fetch_errors = Counter::with_opts(
            Opts::new(
                "fetch_errors_total",
                "Total fetch or rewind failures from the durable log.",
            )
            .namespace("sitepulse"),
        )?;
        let commit_errors = Counter::with_opts(
            Opts::new("commit_errors_total", "Total failed offset commits.")
                .namespace("sitepulse"),
        )?;
        let committed_offset = GaugeVec::new(
            Opts::new(
                "committed_offset",
                "Last committed offset per partition.",
            )
            .namespace("sitepulse"),
            &["partition"],
        )?;
        let processors_running = Gauge::with_opts(
            Opts::new("processors_running", "Number of running processor loops.")
                .namespace("sitepulse"),
        )?;

        // === Store ===
        let store_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_duration_seconds",
                "Store call duration by operation.",
            )
            .namespace("sitepulse")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation"],
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether ClickHouse connection is established (1=yes, 0=no).",
            )
            .namespace("sitepulse"),
        )?;

        // === Reporting ===
        let stats_requests = CounterVec::new(
            Opts::new(
                "stats_requests_total",
                "Total stats requests by response status.",
            )
            .namespace("sitepulse"),
            &["status"],
        )?;

        registry.register(Box::new(ingress_requests.clone()))?;
        registry.register(Box::new(append_duration.clone()))?;
        registry.register(Box::new(events_fetched.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(events_persisted.clone()))?;
        registry.register(Box::new(persist_errors.clone()))?;
        registry.register(Box::new(rewinds.clone()))?;
        registry.register(Box::new(fetch_errors.clone()))?;
        registry.register(Box::new(commit_errors.clone()))?;
        registry.register(Box::new(committed_offset.clone()))?;
        registry.register(Box::new(processors_running.clone()))?;
        registry.register(Box::new(store_duration.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(stats_requests.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ingress_requests,
            append_duration,
            events_fetched,
            decode_errors,
            events_persisted,
            persist_errors,
            rewinds,
            fetch_errors,
            commit_errors,
            committed_offset,
            processors_running,
            store_duration,
            clickhouse_connected,
            stats_requests,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = self.router();

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

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    fn router(&self) -> Router {
        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state)
    }
}

/// Resolves a listen address, expanding the `:port` shorthand to all
/// interfaces and substituting `default` when empty.
pub fn bind_address(addr: &str, default: &str) -> String {
    let addr = if addr.is_empty() { default } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
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
