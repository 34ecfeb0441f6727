use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "conntracct";

/// Prometheus metrics for the pipeline's health.
///
/// All metrics use the "conntracct" namespace. Counters mirror the probe's
/// and sinks' own atomic counters and are advanced by the agent's stats
/// reporter.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Events received from the event source.
    pub events_received: Counter,
    /// Fatal probe errors.
    pub fatal_errors: Counter,
    /// Whether the probe is running (1=yes, 0=no).
    pub probe_running: Gauge,
    /// Number of registered consumers.
    pub consumers_registered: Gauge,
    /// Events dropped because a consumer's channel was full, by consumer.
    pub consumer_events_dropped: CounterVec,
    /// Events pushed into a sink, by sink.
    pub sink_events_pushed: CounterVec,
    /// Batches delivered to a backend, by sink.
    pub sink_batches_sent: CounterVec,
    /// Batches lost to backend errors or a full delivery queue, by sink.
    pub sink_batches_dropped: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total accounting events received from the event source.",
            )
            .namespace(NAMESPACE),
        )?;
        let fatal_errors = Counter::with_opts(
            Opts::new("fatal_errors_total", "Total fatal probe errors.").namespace(NAMESPACE),
        )?;
        let probe_running = Gauge::with_opts(
            Opts::new("probe_running", "Whether the probe is running (1=yes, 0=no).")
                .namespace(NAMESPACE),
        )?;
        let consumers_registered = Gauge::with_opts(
            Opts::new("consumers_registered", "Number of registered consumers.")
                .namespace(NAMESPACE),
        )?;
        let consumer_events_dropped = CounterVec::new(
            Opts::new(
                "consumer_events_dropped_total",
                "Total events dropped because the consumer channel was full.",
            )
            .namespace(NAMESPACE),
            &["consumer"],
        )?;
        let sink_events_pushed = CounterVec::new(
            Opts::new("sink_events_pushed_total", "Total events pushed into a sink.")
                .namespace(NAMESPACE),
            &["sink"],
        )?;
        let sink_batches_sent = CounterVec::new(
            Opts::new(
                "sink_batches_sent_total",
                "Total batches delivered to the sink backend.",
            )
            .namespace(NAMESPACE),
            &["sink"],
        )?;
        let sink_batches_dropped = CounterVec::new(
            Opts::new(
                "sink_batches_dropped_total",
                "Total batches dropped by the sink.",
            )
            .namespace(NAMESPACE),
            &["sink"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(fatal_errors.clone()))?;
        registry.register(Box::new(probe_running.clone()))?;
        registry.register(Box::new(consumers_registered.clone()))?;
        registry.register(Box::new(consumer_events_dropped.clone()))?;
        registry.register(Box::new(sink_events_pushed.clone()))?;
        registry.register(Box::new(sink_batches_sent.clone()))?;
        registry.register(Box::new(sink_batches_dropped.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            fatal_errors,
            probe_running,
            consumers_registered,
            consumer_events_dropped,
            sink_events_pushed,
            sink_batches_sent,
            sink_batches_dropped,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
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
