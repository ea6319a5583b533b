//! Bounded measurement scheduling with caching and in-flight de-duplication
//!
//! Each submitted candidate becomes one task. A task first consults the
//! result cache, then the in-flight map: the first task for a path becomes the
//! leader and measures it, later tasks for the same path follow and wait for
//! the leader's result. A worker permit is held only while the prober runs.

use super::cache::ResultCache;
use super::{SizeProber, DEFAULT_MEASURE_TIMEOUT};
use crate::models::{AttributionRecord, Candidate, MeasurementResult};
use crate::observability::EngineMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum concurrent measurements
    pub max_workers: usize,
    /// Deadline for a single measurement
    pub measure_timeout: Duration,
    /// How long a result is reused; zero disables caching
    pub cache_ttl: Duration,
    /// Capacity of the result channel of each run
    pub channel_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 6,
            measure_timeout: DEFAULT_MEASURE_TIMEOUT,
            cache_ttl: Duration::from_secs(20),
            channel_buffer: 64,
        }
    }
}

/// Event emitted on a measurement stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleEvent {
    /// One candidate measured, in completion order
    Measured(AttributionRecord),
    /// Last event of a run
    Finished { cancelled: bool },
}

type InFlight = watch::Receiver<Option<MeasurementResult>>;

struct Shared {
    prober: Arc<dyn SizeProber>,
    cache: ResultCache,
    config: SchedulerConfig,
    workers: Semaphore,
    in_flight: DashMap<PathBuf, InFlight>,
    metrics: EngineMetrics,
}

/// Runs measurements on a bounded worker pool
pub struct MeasurementScheduler {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
}

impl MeasurementScheduler {
    pub fn new(prober: Arc<dyn SizeProber>, config: SchedulerConfig) -> Self {
        Self::with_cache(prober, config, ResultCache::new())
    }

    /// Scheduler with a caller-supplied cache, e.g. one driven by a manual clock
    pub fn with_cache(
        prober: Arc<dyn SizeProber>,
        config: SchedulerConfig,
        cache: ResultCache,
    ) -> Self {
        let workers = Semaphore::new(config.max_workers.max(1));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                prober,
                cache,
                config,
                workers,
                in_flight: DashMap::new(),
                metrics: EngineMetrics::new(),
            }),
            shutdown,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.shared.cache
    }

    /// Measure a single path through the cache and de-duplication layers
    pub async fn measure(&self, path: &Path) -> MeasurementResult {
        self.shared.resolve(path).await
    }

    /// Measure every candidate concurrently. Results arrive in completion
    /// order followed by [`ScheduleEvent::Finished`]. Dropping the returned
    /// stream cancels outstanding measurements.
    pub fn submit(&self, candidates: Vec<Candidate>) -> MeasurementStream {
        let (tx, rx) = mpsc::channel(self.shared.config.channel_buffer.max(1));
        let shared = self.shared.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let total = candidates.len();
            let mut tasks = JoinSet::new();
            for candidate in candidates {
                let shared = shared.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let result = shared.resolve(&candidate.path).await;
                    let record = AttributionRecord {
                        attribution: candidate.attribution,
                        result,
                    };
                    // A closed channel is picked up by the driver below
                    let _ = tx.send(ScheduleEvent::Measured(record)).await;
                });
            }

            let mut cancelled = false;
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        None => break,
                        Some(Err(e)) if e.is_panic() => {
                            warn!(error = %e, "Measurement task panicked");
                        }
                        Some(_) => {}
                    },
                    _ = tx.closed() => {
                        debug!("Result consumer went away, cancelling run");
                        cancelled = true;
                        break;
                    }
                    _ = shutdown_signal(&mut shutdown) => {
                        debug!("Shutdown requested, cancelling run");
                        cancelled = true;
                        break;
                    }
                }
            }

            if cancelled {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }

            debug!(candidates = total, cancelled, "Measurement run finished");
            let _ = tx.send(ScheduleEvent::Finished { cancelled }).await;
        });

        MeasurementStream { rx }
    }

    /// Cancel every run in progress. Cached results stay valid.
    pub fn shutdown(&self) {
        // No receivers simply means no run is active
        let _ = self.shutdown.send(());
    }
}

/// Resolves when a shutdown is broadcast; never resolves once the sender is gone
async fn shutdown_signal(rx: &mut broadcast::Receiver<()>) {
    match rx.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
    }
}

/// Removes the in-flight entry when the leader finishes or is aborted
struct InFlightGuard<'a> {
    map: &'a DashMap<PathBuf, InFlight>,
    path: &'a Path,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(self.path);
    }
}

struct GaugeGuard<'a>(&'a EngineMetrics);

impl<'a> GaugeGuard<'a> {
    fn new(metrics: &'a EngineMetrics) -> Self {
        metrics.inc_in_flight();
        Self(metrics)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.dec_in_flight();
    }
}

impl Shared {
    async fn resolve(&self, path: &Path) -> MeasurementResult {
        if let Some(result) = self.prober.pre_filter(path) {
            return result;
        }

        loop {
            if let Some(result) = self.cache.get(path) {
                self.metrics.inc_cache_hit();
                return result;
            }

            let role = match self.in_flight.entry(path.to_path_buf()) {
                Entry::Occupied(entry) => Err(entry.get().clone()),
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(rx);
                    Ok(tx)
                }
            };

            match role {
                Ok(tx) => return self.lead(path, tx).await,
                Err(mut rx) => {
                    self.metrics.inc_dedup_wait();
                    let outcome = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
                    match outcome {
                        Ok(Some(result)) => return result,
                        // Leader was aborted before publishing; try again
                        _ => continue,
                    }
                }
            }
        }
    }

    async fn lead(
        &self,
        path: &Path,
        tx: watch::Sender<Option<MeasurementResult>>,
    ) -> MeasurementResult {
        let _entry = InFlightGuard {
            map: &self.in_flight,
            path,
        };

        // Another leader may have finished between our lookup and insert
        if let Some(result) = self.cache.get(path) {
            self.metrics.inc_cache_hit();
            tx.send_replace(Some(result.clone()));
            return result;
        }
        self.metrics.inc_cache_miss();

        let result = {
            let _permit = match self.workers.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return MeasurementResult::error(path, "worker pool closed", Duration::ZERO)
                }
            };
            let _gauge = GaugeGuard::new(&self.metrics);
            let started = Instant::now();
            let result = self
                .prober
                .measure(path, self.config.measure_timeout)
                .await;
            self.metrics
                .observe_measurement(result.status, started.elapsed().as_secs_f64());
            result
        };

        self.cache.put(path, result.clone(), self.config.cache_ttl);
        tx.send_replace(Some(result.clone()));
        result
    }
}

/// Completion-ordered results of one submitted batch
pub struct MeasurementStream {
    rx: mpsc::Receiver<ScheduleEvent>,
}

impl MeasurementStream {
    /// Next event, `None` after [`ScheduleEvent::Finished`]
    pub async fn next(&mut self) -> Option<ScheduleEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<ScheduleEvent> {
        ReceiverStream::new(self.rx)
    }
}
