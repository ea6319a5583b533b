//! Health tracking for the storage agent
//!
//! Each discovery source and the measurement scheduler is a component.
//! A failing source degrades its component; attribution keeps running with
//! the remaining sources, so only an unhealthy component blocks readiness.

use crate::models::{DiscoverySource, RunSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing, but attribution continues without it
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunSummary>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|h| h.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const MOUNT_TABLE: &str = "mount_table";
    pub const RUNTIME: &str = "runtime";
    pub const VOLUMES: &str = "volumes";
    pub const SCHEDULER: &str = "scheduler";

    /// Every component the agent registers at startup
    pub const ALL: &[&str] = &[MOUNT_TABLE, RUNTIME, VOLUMES, SCHEDULER];
}

/// Component name tracking a discovery source
pub fn component_for(source: DiscoverySource) -> &'static str {
    match source {
        DiscoverySource::MountTable => components::MOUNT_TABLE,
        DiscoverySource::Runtime => components::RUNTIME,
        DiscoverySource::Volumes => components::VOLUMES,
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    components: HashMap<String, ComponentHealth>,
    ready: bool,
    last_run: Option<RunSummary>,
}

/// Shared component health, readiness flag and latest run summary.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.set_healthy(name).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record the outcome of one discovery source for the latest run
    pub async fn set_source(&self, source: DiscoverySource, failure: Option<&str>) {
        let name = component_for(source);
        match failure {
            None => self.set_healthy(name).await,
            Some(message) => self.set_degraded(name, message).await,
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Store the summary of the most recent run
    pub async fn set_last_run(&self, summary: RunSummary) {
        self.state.write().await.last_run = Some(summary);
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: HealthResponse::compute_status(&state.components),
            components: state.components.clone(),
            last_run: state.last_run.clone(),
        }
    }

    /// Ready once startup finished, unless a component is unhealthy.
    /// A degraded discovery source does not block readiness.
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let reason = if !state.ready {
            Some("Agent not yet initialized")
        } else if !HealthResponse::compute_status(&state.components).is_operational() {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(health.last_run.is_none());
    }

    #[tokio::test]
    async fn test_register_all_components() {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }

        let health = registry.health().await;
        assert_eq!(health.components.len(), 4);
        assert_eq!(
            health.components[components::SCHEDULER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_failed_source_degrades_without_blocking_readiness() {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry.set_ready(true).await;

        registry
            .set_source(DiscoverySource::Runtime, Some("crictl not found"))
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::RUNTIME].message.as_deref(),
            Some("crictl not found")
        );
        assert!(registry.readiness().await.ready);

        registry.set_source(DiscoverySource::Runtime, None).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::SCHEDULER).await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::SCHEDULER, "worker pool closed")
            .await;

        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_last_run_is_reported() {
        let registry = HealthRegistry::new();
        registry
            .set_last_run(RunSummary {
                total_bytes: 42,
                ..Default::default()
            })
            .await;

        let health = registry.health().await;
        assert_eq!(health.last_run.map(|s| s.total_bytes), Some(42));
    }
}
