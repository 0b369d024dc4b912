use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state, initially ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready or draining.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the `/metrics`, `/health` and `/ready` routes.
pub fn app(
    render: impl Fn() -> String + Clone + Send + Sync + 'static,
    health: HealthState,
) -> Router {
    Router::new()
        .route("/metrics", get(move || std::future::ready(render())))
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health.clone())))
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the listener fails.
pub async fn start_metrics_server(addr: SocketAddr, health: HealthState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let app = app(move || handle.render(), health);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// 200 while serving, 503 once shutdown has begun.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "draining",
                ready: false,
            }),
        )
    }
}

/// Gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("sigrelay_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("sigrelay_connections_active").decrement(1.0);
    }

    /// Set the number of identities currently in the registry.
    #[allow(clippy::cast_precision_loss)]
    pub fn identities_registered(count: usize) {
        metrics::gauge!("sigrelay_identities_registered").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a refused connection with the given reason label.
    pub fn connections_rejected_total(reason: &'static str) {
        metrics::counter!("sigrelay_connections_rejected_total", "reason" => reason).increment(1);
    }

    /// Increment the inbound message counter.
    pub fn messages_received_total() {
        metrics::counter!("sigrelay_messages_received_total").increment(1);
    }

    /// Increment the per-destination delivery counter.
    pub fn messages_relayed_total() {
        metrics::counter!("sigrelay_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("sigrelay_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record bytes relayed in the given direction.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("sigrelay_payload_bytes_total", "direction" => direction)
            .increment(bytes);
    }

    /// Increment the counter of connections closed because their identity was reclaimed.
    pub fn identity_superseded_total() {
        metrics::counter!("sigrelay_identity_superseded_total").increment(1);
    }
}

/// Histograms.
pub mod histograms {
    /// Record how many destinations one inbound message was fanned out to.
    #[allow(clippy::cast_precision_loss)]
    pub fn fanout_size(destinations: usize) {
        metrics::histogram!("sigrelay_fanout_size").record(destinations as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn health_state_toggles() {
        let state = HealthState::new();
        assert!(state.is_ready());
        state.set_ready(false);
        assert!(!state.is_ready());
        assert!(!state.clone().is_ready());
    }

    #[tokio::test]
    async fn ready_reports_draining_after_shutdown() {
        let health = HealthState::new();
        let app = app(String::new, health.clone());

        let ok = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        health.set_ready(false);
        let draining = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(draining.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_route_renders_recorder_output() {
        let app = app(
            || "sigrelay_connections_active 0\n".to_string(),
            HealthState::new(),
        );
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
