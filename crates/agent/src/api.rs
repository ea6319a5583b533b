//! HTTP API for health checks and Prometheus metrics

use attribution_lib::{health::HealthRegistry, observability::EngineMetrics};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: EngineMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: EngineMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

/// 200 while operational (a failed discovery source only degrades), 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness))
}

/// Prometheus text exposition of the global registry
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = Vec::new();
    let code = match TextEncoder::new().encode(&state.metrics.gather(), &mut body) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            body.clear();
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (code, [("content-type", TEXT_FORMAT)], body)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
