//! Periodic attribution loop
//!
//! Runs an attribution cycle on a fixed interval, logs every record, and
//! publishes run results to Prometheus and the health registry.

use super::{AttributionAssembler, AttributionEvent};
use crate::health::{components, HealthRegistry};
use crate::models::{Attribution, DiscoverySource, RunSummary};
use crate::observability::{EngineMetrics, StructuredLogger};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Default time between attribution runs
pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(300);

pub struct AttributionLoop {
    assembler: AttributionAssembler,
    interval: Duration,
    logger: StructuredLogger,
    metrics: EngineMetrics,
    health: Option<HealthRegistry>,
}

impl AttributionLoop {
    pub fn new(assembler: AttributionAssembler, interval: Duration, logger: StructuredLogger) -> Self {
        Self {
            assembler,
            interval,
            logger,
            metrics: EngineMetrics::new(),
            health: None,
        }
    }

    /// Report source and scheduler health after every run
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until a shutdown is broadcast. A run in progress is cancelled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting attribution loop"
        );

        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut run = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("Shutting down attribution loop");
                    break;
                }
            }

            run += 1;
            tokio::select! {
                _ = self.run_once(run) => {}
                _ = shutdown.recv() => {
                    info!(run, "Shutdown during attribution run, cancelling");
                    break;
                }
            }
        }
    }

    /// Execute one attribution cycle and publish its results
    pub async fn run_once(&self, run: u64) -> RunSummary {
        self.logger.log_run_started(run);

        let mut failures: HashMap<DiscoverySource, String> = HashMap::new();
        let mut events = self.assembler.run();
        let mut summary = None;

        while let Some(event) = events.next().await {
            match event {
                AttributionEvent::Record(record) => match &record.attribution {
                    Attribution::DiscoveryFailure { source, message } => {
                        self.logger.log_discovery_failure(*source, message);
                        self.metrics.inc_discovery_failure(*source);
                        failures.insert(*source, message.clone());
                    }
                    _ => self.logger.log_attribution(&record),
                },
                AttributionEvent::Completed(done) => {
                    summary = Some(done);
                    break;
                }
            }
        }

        let summary = summary.unwrap_or_else(|| RunSummary {
            cancelled: true,
            ..Default::default()
        });

        self.metrics.set_last_run(&summary);
        self.logger.log_run_completed(run, &summary);

        if let Some(health) = &self.health {
            for source in [
                DiscoverySource::MountTable,
                DiscoverySource::Runtime,
                DiscoverySource::Volumes,
            ] {
                health
                    .set_source(source, failures.get(&source).map(String::as_str))
                    .await;
            }
            if summary.timeouts > 0 {
                health
                    .set_degraded(
                        components::SCHEDULER,
                        format!("{} measurements timed out", summary.timeouts),
                    )
                    .await;
            } else {
                health.set_healthy(components::SCHEDULER).await;
            }
            health.set_last_run(summary.clone()).await;
        }

        summary
    }
}
