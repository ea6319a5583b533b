//! Node storage attribution engine
//!
//! Answers "which pod or container is consuming this node's disk" by:
//! - Discovering container writable layers (overlay upperdirs) and emptyDir volumes
//! - Correlating them with container runtime metadata
//! - Measuring each path with bounded concurrency, caching and deadlines
//! - Streaming attributed results with health checks and observability

pub mod attribution;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod host;
pub mod measure;
pub mod models;
pub mod observability;
pub mod size;

pub use attribution::{
    AttributionAssembler, AttributionAssemblerBuilder, AttributionEvent, AttributionLoop,
    AttributionRun,
};
pub use config::EngineConfig;
pub use error::{DiscoveryError, MeasurementError, ParseError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use host::HostRoot;
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
