//! Storage Agent - node disk usage attribution
//!
//! Runs as a DaemonSet on each Kubernetes node, periodically attributing
//! container writable layers and emptyDir volumes to their pods.

use attribution_lib::{
    attribution::{AttributionAssembler, AttributionLoop},
    health::{components, HealthRegistry},
    observability::{EngineMetrics, StructuredLogger},
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time allowed for a cancelled run to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting storage-agent");

    let config = config::AgentConfig::load()?;
    let engine_config = config.to_engine_config();
    info!(
        node_name = %config.node_name,
        host_root = ?engine_config.host_root,
        max_workers = engine_config.max_workers,
        measure_timeout_secs = engine_config.measure_timeout.as_secs(),
        cache_ttl_secs = engine_config.cache_ttl.as_secs(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let metrics = EngineMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    let host_root = engine_config
        .host_root
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    logger.log_startup(AGENT_VERSION, &host_root);

    let assembler = AttributionAssembler::from_config(&engine_config);
    let scheduler = assembler.scheduler().clone();
    let attribution_loop =
        AttributionLoop::new(assembler, config.run_interval(), logger.clone())
            .with_health(health_registry.clone());

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(attribution_loop.run(shutdown_rx));

    health_registry.set_ready(true).await;

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    scheduler.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, loop_handle).await.is_err() {
        warn!("Attribution loop did not stop in time");
    }
    api_handle.abort();

    info!("Shutting down");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT received")
            }
            _ = terminate.recv() => Ok("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT received")
    }
}
