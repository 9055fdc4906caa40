//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::controllers::Caches;

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Address the health server listens on. Kubelet probes target the pod IP,
/// so every interface is bound.
pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the operator has completed startup.
    started: AtomicBool,
    /// Caches whose initial sync gates readiness.
    caches: Arc<Caches>,
}

impl HealthState {
    pub fn new(caches: Arc<Caches>) -> Self {
        Self {
            started: AtomicBool::new(false),
            caches,
        }
    }

    /// Mark the operator as started.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the health check HTTP server.
///
/// Runs until the server encounters a fatal error. The operator is marked as
/// started only after the listener is bound.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    let listener = TcpListener::bind(listen_addr(port)).await?;

    info!(port = port, "Health check server listening");
    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe endpoint.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 Service Unavailable until startup has completed and every
/// watch cache has finished its initial list.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if !state.caches.all_synced() {
        debug!("Readiness probe: NOT READY (caches not synced)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    debug!("Readiness probe: OK");
    StatusCode::OK
}
