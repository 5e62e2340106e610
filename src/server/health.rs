//! Health check and metrics endpoints
//!
//! - `/healthz` - Liveness: Is the process alive?
//! - `/readyz` - Readiness: Have the controller loops started?
//! - `/metrics` - Prometheus text exposition

use crate::server::metrics::SharedMetrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state for readiness tracking
///
/// The controller sets this to ready once its tick loop and watchers run.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    /// Create a new readiness state (initially not ready)
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

/// Liveness probe handler
///
/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Returns 200 OK if ready, 503 Service Unavailable if not.
async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                String::new(),
            )
        }
    }
}

/// Run the health server on the specified port
///
/// This function runs forever until the server is shut down
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics_registry: SharedMetrics,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(ServerState {
            readiness,
            metrics: metrics_registry,
        });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - server is actually listening
    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
