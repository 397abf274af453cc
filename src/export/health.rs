use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "bizpulse";

/// Prometheus metrics for the aggregation engines and their collaborators.
///
/// All metrics use the "bizpulse" namespace. Organized into tiers:
/// - Core: cycle and cache counters
/// - Sources: fetch and transport metrics
/// - Live: push-channel metrics
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Core ===
    /// Aggregation cycles by view and result (started/published/discarded/cancelled).
    pub cycles_total: CounterVec,
    /// Cache lookups on selection change by view and result (hit/miss).
    pub cache_lookups_total: CounterVec,
    /// Entries currently held in each view's snapshot cache.
    pub cache_entries: GaugeVec,
    /// Records dropped while folding a batch, by collection and reason.
    pub records_skipped_total: CounterVec,

    // === Sources ===
    /// Collection fetches by collection and outcome (primary/fallback/failed).
    pub fetch_requests_total: CounterVec,
    /// Primary-then-fallback fetch duration by collection.
    pub fetch_duration: HistogramVec,
    /// Raw HTTP requests by endpoint and status.
    pub source_requests_total: CounterVec,
    /// Raw HTTP request duration by endpoint.
    pub source_request_duration: HistogramVec,

    // === Live ===
    /// Live events by view and outcome.
    pub live_events_total: CounterVec,
    /// Whether the push channel is connected (1=yes, 0=no).
    pub live_connected: Gauge,
    /// Push frames that could not be decoded.
    pub live_frames_rejected: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Core ===
        let cycles_total = CounterVec::new(
            Opts::new("cycles_total", "Aggregation cycles by view and result.")
                .namespace(NAMESPACE),
            &["view", "result"],
        )?;
        let cache_lookups_total = CounterVec::new(
            Opts::new(
                "cache_lookups_total",
                "Snapshot cache lookups on selection change.",
            )
            .namespace(NAMESPACE),
            &["view", "result"],
        )?;
        let cache_entries = GaugeVec::new(
            Opts::new("cache_entries", "Entries held in the snapshot cache.")
                .namespace(NAMESPACE),
            &["view"],
        )?;
        let records_skipped_total = CounterVec::new(
            Opts::new(
                "records_skipped_total",
                "Records dropped while folding a fetched batch.",
            )
            .namespace(NAMESPACE),
            &["collection", "reason"],
        )?;

        // === Sources ===
        let fetch_requests_total = CounterVec::new(
            Opts::new(
                "fetch_requests_total",
                "Collection fetches by collection and outcome.",
            )
            .namespace(NAMESPACE),
            &["collection", "outcome"],
        )?;
        let fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                "fetch_duration_seconds",
                "Primary-then-fallback fetch duration.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["collection"],
        )?;
        let source_requests_total = CounterVec::new(
            Opts::new(
                "source_requests_total",
                "HTTP requests to the data source by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let source_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "source_request_duration_seconds",
                "HTTP request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )?;

        // === Live ===
        let live_events_total = CounterVec::new(
            Opts::new("live_events_total", "Live events by view and outcome.")
                .namespace(NAMESPACE),
            &["view", "outcome"],
        )?;
        let live_connected = Gauge::with_opts(
            Opts::new(
                "live_connected",
                "Whether the push channel is connected (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let live_frames_rejected = Counter::with_opts(
            Opts::new(
                "live_frames_rejected_total",
                "Push frames that could not be decoded.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cache_lookups_total.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(records_skipped_total.clone()))?;
        registry.register(Box::new(fetch_requests_total.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(source_requests_total.clone()))?;
        registry.register(Box::new(source_request_duration.clone()))?;
        registry.register(Box::new(live_events_total.clone()))?;
        registry.register(Box::new(live_connected.clone()))?;
        registry.register(Box::new(live_frames_rejected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles_total,
            cache_lookups_total,
            cache_entries,
            records_skipped_total,
            fetch_requests_total,
            fetch_duration,
            source_requests_total,
            source_request_duration,
            live_events_total,
            live_connected,
            live_frames_rejected,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Router serving /metrics and /healthz.
    pub fn router(&self) -> Router {
        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state)
    }

    /// Starts the HTTP server serving /metrics, /healthz and the routes of
    /// `api`. Returns the bound address.
    pub async fn start(&self, api: Router) -> Result<SocketAddr> {
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

        let app = self.router().merge(api);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "http server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the HTTP server.
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

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
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
