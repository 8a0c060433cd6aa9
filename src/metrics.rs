use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics covering every stage of the forwarding pipeline.
///
/// The intake policy reads the counters back (`IntCounter::get`), so these
/// are the source of truth for queued/dropped accounting, not a mirror.
pub struct ServiceMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events offered to `process`.
    pub events_queued: IntCounter,
    /// Total non-lifecycle events discarded at the capacity limit.
    pub events_dropped: IntCounter,
    /// Total events delivered inside successfully posted entities.
    pub events_posted: IntCounter,
    /// Total pending-buffer flushes into entities.
    pub flushes: IntCounter,
    /// Total entity post attempts, including retries.
    pub entity_post_attempts: IntCounter,
    /// Total entity posts accepted by the server.
    pub entity_post_successes: IntCounter,
    /// Total network-level post failures (retried).
    pub entity_post_failures: IntCounter,
    /// Total application-level rejections (never retried).
    pub entity_post_rejections: IntCounter,
    /// Total failed domain registrations.
    pub domain_put_failures: IntCounter,

    /// Actions currently queued for posting.
    pub post_queue_actions: IntGauge,
    /// Sum of queued action sizes (events awaiting posting).
    pub post_queue_event_size: IntGauge,
    /// Current retry delay in milliseconds.
    pub retry_delay_ms: IntGauge,
    /// Wall-clock time of the last successful post, in epoch milliseconds.
    pub last_post_timestamp_ms: IntGauge,
    /// Service lifecycle state (0=created, 1=started, 2=stopped).
    pub service_state: IntGauge,
}

impl ServiceMetrics {
    /// Creates a metrics instance with all series registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_queued = IntCounter::with_opts(
            Opts::new("events_queued_total", "Total events offered to the sink.")
                .namespace("atsrelay"),
        )?;
        let events_dropped = IntCounter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total non-lifecycle events discarded at the capacity limit.",
            )
            .namespace("atsrelay"),
        )?;
        let events_posted = IntCounter::with_opts(
            Opts::new(
                "events_posted_total",
                "Total events delivered inside successfully posted entities.",
            )
            .namespace("atsrelay"),
        )?;
        let flushes = IntCounter::with_opts(
            Opts::new("flushes_total", "Total pending-buffer flushes into entities.")
                .namespace("atsrelay"),
        )?;
        let entity_post_attempts = IntCounter::with_opts(
            Opts::new(
                "entity_post_attempts_total",
                "Total entity post attempts, including retries.",
            )
            .namespace("atsrelay"),
        )?;
        let entity_post_successes = IntCounter::with_opts(
            Opts::new(
                "entity_post_successes_total",
                "Total entity posts accepted by the Timeline Server.",
            )
            .namespace("atsrelay"),
        )?;
        let entity_post_failures = IntCounter::with_opts(
            Opts::new(
                "entity_post_failures_total",
                "Total network-level post failures (retried).",
            )
            .namespace("atsrelay"),
        )?;
        let entity_post_rejections = IntCounter::with_opts(
            Opts::new(
                "entity_post_rejections_total",
                "Total application-level rejections (never retried).",
            )
            .namespace("atsrelay"),
        )?;
        let domain_put_failures = IntCounter::with_opts(
            Opts::new(
                "domain_put_failures_total",
                "Total failed access-control domain registrations.",
            )
            .namespace("atsrelay"),
        )?;

        let post_queue_actions = IntGauge::with_opts(
            Opts::new("post_queue_actions", "Actions currently queued for posting.")
                .namespace("atsrelay"),
        )?;
        let post_queue_event_size = IntGauge::with_opts(
            Opts::new(
                "post_queue_event_size",
                "Sum of queued action sizes (events awaiting posting).",
            )
            .namespace("atsrelay"),
        )?;
        let retry_delay_ms = IntGauge::with_opts(
            Opts::new("retry_delay_ms", "Current retry delay in milliseconds.")
                .namespace("atsrelay"),
        )?;
        let last_post_timestamp_ms = IntGauge::with_opts(
            Opts::new(
                "last_post_timestamp_ms",
                "Wall-clock time of the last successful post (epoch ms).",
            )
            .namespace("atsrelay"),
        )?;
        let service_state = IntGauge::with_opts(
            Opts::new(
                "service_state",
                "Service lifecycle state (0=created, 1=started, 2=stopped).",
            )
            .namespace("atsrelay"),
        )?;

        registry.register(Box::new(events_queued.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(events_posted.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(entity_post_attempts.clone()))?;
        registry.register(Box::new(entity_post_successes.clone()))?;
        registry.register(Box::new(entity_post_failures.clone()))?;
        registry.register(Box::new(entity_post_rejections.clone()))?;
        registry.register(Box::new(domain_put_failures.clone()))?;
        registry.register(Box::new(post_queue_actions.clone()))?;
        registry.register(Box::new(post_queue_event_size.clone()))?;
        registry.register(Box::new(retry_delay_ms.clone()))?;
        registry.register(Box::new(last_post_timestamp_ms.clone()))?;
        registry.register(Box::new(service_state.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_queued,
            events_dropped,
            events_posted,
            flushes,
            entity_post_attempts,
            entity_post_successes,
            entity_post_failures,
            entity_post_rejections,
            domain_put_failures,
            post_queue_actions,
            post_queue_event_size,
            retry_delay_ms,
            last_post_timestamp_ms,
            service_state,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Handle the ":port" shorthand.
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
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
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
