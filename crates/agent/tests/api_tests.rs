//! HTTP surface tests for the storage agent
//!
//! The router is rebuilt here because the binary crate exposes no library
//! target; handlers mirror `src/api.rs`.

use attribution_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    models::{DiscoverySource, MeasurementStatus, RunSummary},
    observability::EngineMetrics,
};
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

struct AppState {
    health_registry: HealthRegistry,
}

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

async fn metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Router over a registry with every agent component registered healthy
async fn agent() -> (Router, HealthRegistry) {
    let registry = HealthRegistry::new();
    for name in components::ALL {
        registry.register(name).await;
    }

    let state = Arc::new(AppState {
        health_registry: registry.clone(),
    });
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    (router, registry)
}

async fn call(app: Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = tokio_test::assert_ok!(app.oneshot(request).await);
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn call_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = call(app, uri).await;
    (status, serde_json::from_str(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_lists_every_component() {
    let (app, _) = agent().await;

    let (status, health) = call_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    for name in ["mount_table", "runtime", "volumes", "scheduler"] {
        assert_eq!(health["components"][name]["status"], "healthy", "{name}");
    }
    assert!(health.get("last_run").is_none());
}

#[tokio::test]
async fn test_failed_source_degrades_but_stays_up() {
    let (app, registry) = agent().await;
    registry
        .set_source(DiscoverySource::Runtime, Some("crictl not found"))
        .await;

    let (status, health) = call_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["components"]["runtime"]["message"], "crictl not found");
    assert_eq!(health["components"]["volumes"]["status"], "healthy");
}

#[tokio::test]
async fn test_unhealthy_scheduler_fails_health_and_readiness() {
    let (app, registry) = agent().await;
    registry.set_ready(true).await;
    registry
        .set_unhealthy(components::SCHEDULER, "worker pool closed")
        .await;

    let (health_status, health) = call_json(app.clone(), "/healthz").await;
    assert_eq!(health_status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");

    let (ready_status, readiness) = call_json(app, "/readyz").await;
    assert_eq!(ready_status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_follows_startup() {
    let (app, registry) = agent().await;

    let (status, readiness) = call_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert!(readiness["reason"].is_string());

    registry.set_ready(true).await;
    let (status, readiness) = call_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
    assert!(readiness.get("reason").is_none());
}

#[tokio::test]
async fn test_healthz_reports_last_run() {
    let (app, registry) = agent().await;
    registry
        .set_last_run(RunSummary {
            writable_layers: 3,
            empty_dirs: 2,
            total_bytes: 4096,
            ..Default::default()
        })
        .await;

    let (_, health) = call_json(app, "/healthz").await;

    assert_eq!(health["last_run"]["writable_layers"], 3);
    assert_eq!(health["last_run"]["empty_dirs"], 2);
    assert_eq!(health["last_run"]["total_bytes"], 4096);
    assert_eq!(health["last_run"]["cancelled"], false);
}

#[tokio::test]
async fn test_metrics_exposes_engine_counters() {
    let (app, _) = agent().await;
    let metrics = EngineMetrics::new();
    metrics.observe_measurement(MeasurementStatus::Ok, 0.4);
    metrics.observe_measurement(MeasurementStatus::Timeout, 60.0);
    metrics.inc_cache_hit();
    metrics.inc_discovery_failure(DiscoverySource::Volumes);
    metrics.set_last_run(&RunSummary {
        total_bytes: 5 * 1024 * 1024,
        ..Default::default()
    });

    let (status, text) = call(app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    for name in [
        "storage_agent_measurement_latency_seconds_bucket",
        "storage_agent_measurement_latency_seconds_count",
        "storage_agent_measurements_total{status=\"ok\"}",
        "storage_agent_measurements_total{status=\"timeout\"}",
        "storage_agent_cache_hits_total",
        "storage_agent_discovery_failures_total{source=\"volumes\"}",
        "storage_agent_last_run_bytes 5242880",
    ] {
        assert!(text.contains(name), "missing {name}");
    }
}

#[tokio::test]
async fn test_metrics_content_type() {
    let (app, _) = agent().await;
    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
