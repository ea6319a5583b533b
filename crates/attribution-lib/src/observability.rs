//! Observability for the attribution engine
//!
//! Provides:
//! - Prometheus metrics (measurement latency and outcomes, cache and dedup activity, discovery failures)
//! - Structured JSON logging with tracing

use crate::models::{AttributionRecord, DiscoverySource, MeasurementStatus, RunSummary};
use prometheus::proto::MetricFamily;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for measurement latency (in seconds); `du` can take minutes
const MEASUREMENT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    measurement_latency_seconds: Histogram,
    measurements: IntCounterVec,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    dedup_waits: IntCounter,
    measurements_in_flight: IntGauge,
    discovery_failures: IntCounterVec,
    last_run_candidates: IntGauge,
    last_run_bytes: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            measurement_latency_seconds: register_histogram!(
                "storage_agent_measurement_latency_seconds",
                "Time spent measuring a single path",
                MEASUREMENT_BUCKETS.to_vec()
            )
            .expect("Failed to register measurement_latency_seconds"),

            measurements: register_int_counter_vec!(
                "storage_agent_measurements_total",
                "Measurements performed, by outcome",
                &["status"]
            )
            .expect("Failed to register measurements_total"),

            cache_hits: register_int_counter!(
                "storage_agent_cache_hits_total",
                "Measurements answered from the result cache"
            )
            .expect("Failed to register cache_hits_total"),

            cache_misses: register_int_counter!(
                "storage_agent_cache_misses_total",
                "Measurements not found in the result cache"
            )
            .expect("Failed to register cache_misses_total"),

            dedup_waits: register_int_counter!(
                "storage_agent_dedup_waits_total",
                "Requests that joined an in-flight measurement of the same path"
            )
            .expect("Failed to register dedup_waits_total"),

            measurements_in_flight: register_int_gauge!(
                "storage_agent_measurements_in_flight",
                "Measurements currently holding a worker"
            )
            .expect("Failed to register measurements_in_flight"),

            discovery_failures: register_int_counter_vec!(
                "storage_agent_discovery_failures_total",
                "Discovery source failures, by source",
                &["source"]
            )
            .expect("Failed to register discovery_failures_total"),

            last_run_candidates: register_int_gauge!(
                "storage_agent_last_run_candidates",
                "Records emitted by the most recent attribution run"
            )
            .expect("Failed to register last_run_candidates"),

            last_run_bytes: register_int_gauge!(
                "storage_agent_last_run_bytes",
                "Total bytes attributed by the most recent attribution run"
            )
            .expect("Failed to register last_run_bytes"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    /// Snapshot of every metric family in the default registry
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner();
        prometheus::gather()
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    /// Record one completed probe
    pub fn observe_measurement(&self, status: MeasurementStatus, duration_secs: f64) {
        self.inner()
            .measurement_latency_seconds
            .observe(duration_secs);
        self.inner()
            .measurements
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn inc_cache_hit(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn inc_dedup_wait(&self) {
        self.inner().dedup_waits.inc();
    }

    pub fn inc_in_flight(&self) {
        self.inner().measurements_in_flight.inc();
    }

    pub fn dec_in_flight(&self) {
        self.inner().measurements_in_flight.dec();
    }

    pub fn inc_discovery_failure(&self, source: DiscoverySource) {
        self.inner()
            .discovery_failures
            .with_label_values(&[source.as_str()])
            .inc();
    }

    /// Publish the totals of a finished run
    pub fn set_last_run(&self, summary: &RunSummary) {
        let records = summary.writable_layers + summary.empty_dirs + summary.discovery_failures;
        self.inner().last_run_candidates.set(records as i64);
        self.inner()
            .last_run_bytes
            .set(i64::try_from(summary.total_bytes).unwrap_or(i64::MAX));
    }
}

/// Structured logger for engine events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, host_root: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            host_root = %host_root,
            "Storage agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Storage agent shutting down"
        );
    }

    pub fn log_run_started(&self, run: u64) {
        info!(
            event = "attribution_run_started",
            node = %self.node_name,
            run = run,
            "Attribution run started"
        );
    }

    /// Log one attributed measurement
    pub fn log_attribution(&self, record: &AttributionRecord) {
        info!(
            event = "path_attributed",
            node = %self.node_name,
            kind = record.attribution.kind(),
            pod_name = record.attribution.pod_name().unwrap_or("unknown"),
            namespace = record.attribution.namespace().unwrap_or("unknown"),
            path = %record.result.path.display(),
            status = record.result.status.as_str(),
            bytes = ?record.result.bytes,
            size = %record.result.human_readable,
            elapsed_ms = record.result.elapsed_ms,
            "Path attributed"
        );
    }

    pub fn log_discovery_failure(&self, source: DiscoverySource, message: &str) {
        warn!(
            event = "discovery_failed",
            node = %self.node_name,
            source = source.as_str(),
            error = %message,
            "Discovery source unavailable"
        );
    }

    /// Log the summary of a finished run
    pub fn log_run_completed(&self, run: u64, summary: &RunSummary) {
        if let Some(warning) = &summary.warning {
            warn!(
                event = "attribution_run_completed",
                node = %self.node_name,
                run = run,
                warning = %warning,
                "Attribution run completed with warnings"
            );
        }
        info!(
            event = "attribution_run_completed",
            node = %self.node_name,
            run = run,
            writable_layers = summary.writable_layers,
            empty_dirs = summary.empty_dirs,
            total_bytes = summary.total_bytes,
            ok = summary.ok,
            errors = summary.errors,
            timeouts = summary.timeouts,
            skipped = summary.skipped,
            discovery_failures = summary.discovery_failures,
            zero_excluded = summary.zero_excluded,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "Attribution run completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_creation() {
        let metrics = EngineMetrics::new();

        metrics.observe_measurement(MeasurementStatus::Ok, 0.5);
        metrics.observe_measurement(MeasurementStatus::Timeout, 60.0);
        metrics.inc_cache_hit();
        metrics.inc_cache_miss();
        metrics.inc_dedup_wait();
        metrics.inc_in_flight();
        metrics.dec_in_flight();
        metrics.inc_discovery_failure(DiscoverySource::Runtime);
        metrics.set_last_run(&RunSummary {
            total_bytes: u64::MAX,
            ..Default::default()
        });

        let families = metrics.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "storage_agent_measurements_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
