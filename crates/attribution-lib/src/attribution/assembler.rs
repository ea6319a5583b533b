//! Attribution cycle: discover, measure, stream
//!
//! Discovery runs sequentially before anything is measured. Each source may
//! fail on its own; a failed source contributes one error record and no
//! candidates, and the cycle continues with what the others found.

use super::{AttributionEvent, AttributionRun};
use crate::config::EngineConfig;
use crate::discovery::{
    correlate, parse_mount_table, ContainerRuntime, CrictlClient, MountTableSource,
    RuntimeSnapshot, VolumeInventory,
};
use crate::error::DiscoveryError;
use crate::measure::{DuProber, MeasurementScheduler, ScheduleEvent};
use crate::models::{
    Attribution, AttributionRecord, Candidate, ContainerRecord, DiscoverySource, EmptyDirItem,
    MeasurementResult, MountEntry, PodRecord, RunSummary,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Assembler behaviour switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Drop `ok` results of zero bytes
    pub skip_zero: bool,
    /// Keep emptyDirs whose directory is a tmpfs mountpoint
    pub include_memory_backed: bool,
    /// Capacity of the event channel of each run
    pub channel_buffer: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            skip_zero: false,
            include_memory_backed: false,
            channel_buffer: 64,
        }
    }
}

/// A discovery source that could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: DiscoverySource,
    /// File, directory or command that failed
    pub location: PathBuf,
    pub message: String,
}

impl SourceFailure {
    fn new(error: &DiscoveryError, location: impl Into<PathBuf>) -> Self {
        Self {
            source: error.source_kind(),
            location: location.into(),
            message: error.to_string(),
        }
    }

    pub fn to_record(&self) -> AttributionRecord {
        AttributionRecord {
            attribution: Attribution::DiscoveryFailure {
                source: self.source,
                message: self.message.clone(),
            },
            result: MeasurementResult::error(&self.location, &self.message, Duration::ZERO),
        }
    }
}

/// Counters describing what discovery saw and dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryDiagnostics {
    pub mount_table: Option<PathBuf>,
    pub skipped_mount_lines: usize,
    pub skipped_runtime_records: usize,
    pub undescribed_containers: usize,
    pub unmatched_mounts: usize,
    pub ambiguous_mounts: usize,
    pub memory_backed_excluded: usize,
}

/// Result of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Writable layers first, then emptyDir volumes
    pub candidates: Vec<Candidate>,
    pub failures: Vec<SourceFailure>,
    pub diagnostics: DiscoveryDiagnostics,
}

impl Discovery {
    /// True when every source failed
    pub fn all_sources_failed(&self) -> bool {
        [
            DiscoverySource::MountTable,
            DiscoverySource::Runtime,
            DiscoverySource::Volumes,
        ]
        .iter()
        .all(|s| self.failures.iter().any(|f| f.source == *s))
    }

    pub fn failed(&self, source: DiscoverySource) -> Option<&SourceFailure> {
        self.failures.iter().find(|f| f.source == source)
    }
}

/// Joins discovery with measurement into attribution runs
#[derive(Clone)]
pub struct AttributionAssembler {
    mounts: MountTableSource,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: VolumeInventory,
    scheduler: Arc<MeasurementScheduler>,
    config: AssemblerConfig,
}

impl AttributionAssembler {
    pub fn new(
        mounts: MountTableSource,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: VolumeInventory,
        scheduler: Arc<MeasurementScheduler>,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            mounts,
            runtime,
            volumes,
            scheduler,
            config,
        }
    }

    /// Assemble the production engine: mount table files, `crictl`, the
    /// kubelet directory and `du`, all seen through the configured host root
    pub fn from_config(config: &EngineConfig) -> Self {
        let host = config.host();
        let prober = DuProber::new(config.du_command.clone(), host.clone(), config.measure_policy())
            .with_host_namespace(config.du_in_host_namespace);

        Self::new(
            MountTableSource::new(config.mount_tables.clone(), host.clone()),
            Arc::new(CrictlClient::new(
                config.runtime_command.clone(),
                config.runtime_timeout,
            )),
            VolumeInventory::new(config.kubelet_root.clone(), host),
            Arc::new(MeasurementScheduler::new(
                Arc::new(prober),
                config.scheduler_config(),
            )),
            AssemblerConfig {
                skip_zero: config.skip_zero,
                include_memory_backed: config.include_memory_backed,
                channel_buffer: config.channel_buffer,
            },
        )
    }

    pub fn scheduler(&self) -> &Arc<MeasurementScheduler> {
        &self.scheduler
    }

    /// Find every measurable path on the node
    pub async fn discover(&self) -> Discovery {
        let mut discovery = Discovery::default();

        let mounts = self.read_mounts(&mut discovery).await;
        let snapshot = match self.runtime.list_containers().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Container runtime unavailable, no writable layers this run");
                discovery
                    .failures
                    .push(SourceFailure::new(&e, self.runtime.endpoint()));
                RuntimeSnapshot::default()
            }
        };
        discovery.diagnostics.skipped_runtime_records = snapshot.skipped_records;
        discovery.diagnostics.undescribed_containers = snapshot.undescribed;

        let pods = if discovery.failed(DiscoverySource::Runtime).is_some() {
            Vec::new()
        } else {
            match self.runtime.list_pods().await {
                Ok(pods) => pods,
                Err(e) => {
                    debug!(error = %e, "Pod listing failed, pod names may be missing");
                    Vec::new()
                }
            }
        };
        let pods = PodIndex::new(&pods, &snapshot.containers);

        let containers: Vec<ContainerRecord> = snapshot
            .containers
            .iter()
            .cloned()
            .map(|c| pods.enrich_container(c))
            .collect();
        let correlation = correlate(&mounts, &containers);
        discovery.diagnostics.unmatched_mounts = correlation.unmatched_mounts;
        discovery.diagnostics.ambiguous_mounts = correlation.ambiguous;
        discovery
            .candidates
            .extend(correlation.items.into_iter().map(Candidate::writable_layer));

        let memory_backed: HashSet<&Path> = mounts
            .iter()
            .filter(|m| m.fstype == "tmpfs")
            .map(|m| m.mountpoint.as_path())
            .collect();

        match self.volumes.list().await {
            Ok(items) => {
                for item in items {
                    if !self.config.include_memory_backed && memory_backed.contains(item.path.as_path())
                    {
                        discovery.diagnostics.memory_backed_excluded += 1;
                        continue;
                    }
                    discovery
                        .candidates
                        .push(Candidate::empty_dir(pods.enrich_volume(item)));
                }
            }
            Err(e) => {
                warn!(error = %e, "Volume inventory unavailable, no emptyDirs this run");
                let location = self.volumes.kubelet_root().join("pods");
                discovery.failures.push(SourceFailure::new(&e, location));
            }
        }

        debug!(
            candidates = discovery.candidates.len(),
            failures = discovery.failures.len(),
            unmatched_mounts = discovery.diagnostics.unmatched_mounts,
            memory_backed_excluded = discovery.diagnostics.memory_backed_excluded,
            "Discovery complete"
        );
        discovery
    }

    async fn read_mounts(&self, discovery: &mut Discovery) -> Vec<MountEntry> {
        match self.mounts.read().await {
            Ok((path, text)) => {
                let mut entries = parse_mount_table(&text);
                let parsed: Vec<MountEntry> = entries.by_ref().collect();
                discovery.diagnostics.skipped_mount_lines = entries.skipped();
                discovery.diagnostics.mount_table = Some(path);
                parsed
            }
            Err(e) => {
                warn!(error = %e, "Mount table unreadable, no writable layers this run");
                let location = match &e {
                    DiscoveryError::MountTableUnreadable { tried, .. } => {
                        tried.first().cloned().unwrap_or_default()
                    }
                    _ => PathBuf::new(),
                };
                discovery.failures.push(SourceFailure::new(&e, location));
                Vec::new()
            }
        }
    }

    /// Start one attribution cycle. Dropping the returned run cancels it.
    pub fn run(&self) -> AttributionRun {
        let (tx, rx) = mpsc::channel(self.config.channel_buffer.max(1));
        let assembler = self.clone();
        tokio::spawn(async move { assembler.drive(tx).await });
        AttributionRun::new(rx)
    }

    async fn drive(self, tx: mpsc::Sender<AttributionEvent>) {
        let started = Instant::now();
        let mut summary = RunSummary {
            started_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        let discovery = self.discover().await;
        summary.skipped_mount_lines = discovery.diagnostics.skipped_mount_lines;
        summary.skipped_runtime_records = discovery.diagnostics.skipped_runtime_records;
        summary.memory_backed_excluded = discovery.diagnostics.memory_backed_excluded;

        if discovery.all_sources_failed() {
            warn!("All discovery sources failed, nothing to measure");
            summary.warning = Some("all discovery sources failed".to_string());
        } else if discovery.candidates.is_empty() {
            warn!("No measurable paths discovered");
            summary.warning = Some("no measurable paths discovered".to_string());
        }

        for failure in &discovery.failures {
            let record = failure.to_record();
            summary.record(&record);
            if tx.send(AttributionEvent::Record(record)).await.is_err() {
                return;
            }
        }

        info!(
            candidates = discovery.candidates.len(),
            "Measuring discovered paths"
        );
        let mut measurements = self.scheduler.submit(discovery.candidates);
        loop {
            let event = tokio::select! {
                event = measurements.next() => event,
                _ = tx.closed() => {
                    debug!("Attribution consumer went away, cancelling run");
                    return;
                }
            };

            match event {
                Some(ScheduleEvent::Measured(record)) => {
                    if self.config.skip_zero && record.result.is_zero() {
                        summary.zero_excluded += 1;
                        continue;
                    }
                    summary.record(&record);
                    if tx.send(AttributionEvent::Record(record)).await.is_err() {
                        return;
                    }
                }
                Some(ScheduleEvent::Finished { cancelled }) => {
                    summary.cancelled = cancelled;
                    break;
                }
                None => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        let _ = tx.send(AttributionEvent::Completed(summary)).await;
    }
}

/// Pod metadata lookups for enriching records
struct PodIndex<'a> {
    by_sandbox: HashMap<&'a str, &'a PodRecord>,
    by_uid: HashMap<&'a str, (&'a str, &'a str)>,
}

impl<'a> PodIndex<'a> {
    fn new(pods: &'a [PodRecord], containers: &'a [ContainerRecord]) -> Self {
        let mut by_uid: HashMap<&str, (&str, &str)> = HashMap::new();
        // Container labels first, pod sandboxes override
        for container in containers {
            if let (Some(uid), Some(name)) = (&container.pod_uid, &container.pod_name) {
                let namespace = container.namespace.as_deref().unwrap_or_default();
                by_uid.insert(uid.as_str(), (name.as_str(), namespace));
            }
        }
        for pod in pods {
            by_uid.insert(pod.uid.as_str(), (pod.name.as_str(), pod.namespace.as_str()));
        }

        Self {
            by_sandbox: pods.iter().map(|p| (p.sandbox_id.as_str(), p)).collect(),
            by_uid,
        }
    }

    fn enrich_container(&self, mut container: ContainerRecord) -> ContainerRecord {
        let pod = container
            .pod_sandbox_id
            .as_deref()
            .and_then(|id| self.by_sandbox.get(id));
        if let Some(pod) = pod {
            if container.pod_name.is_none() {
                container.pod_name = Some(pod.name.clone());
            }
            if container.namespace.is_none() && !pod.namespace.is_empty() {
                container.namespace = Some(pod.namespace.clone());
            }
            if container.pod_uid.is_none() {
                container.pod_uid = Some(pod.uid.clone());
            }
        }
        container
    }

    fn enrich_volume(&self, mut item: EmptyDirItem) -> EmptyDirItem {
        if let Some((name, namespace)) = self.by_uid.get(item.pod_uid.as_str()) {
            item.pod_name = Some(name.to_string());
            item.namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        }
        item
    }
}

/// Builder for an [`AttributionAssembler`] from individual parts
pub struct AttributionAssemblerBuilder {
    mounts: Option<MountTableSource>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    volumes: Option<VolumeInventory>,
    scheduler: Option<Arc<MeasurementScheduler>>,
    config: AssemblerConfig,
}

impl AttributionAssemblerBuilder {
    pub fn new() -> Self {
        Self {
            mounts: None,
            runtime: None,
            volumes: None,
            scheduler: None,
            config: AssemblerConfig::default(),
        }
    }

    pub fn mounts(mut self, mounts: MountTableSource) -> Self {
        self.mounts = Some(mounts);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn volumes(mut self, volumes: VolumeInventory) -> Self {
        self.volumes = Some(volumes);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<MeasurementScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn skip_zero(mut self, skip: bool) -> Self {
        self.config.skip_zero = skip;
        self
    }

    pub fn include_memory_backed(mut self, include: bool) -> Self {
        self.config.include_memory_backed = include;
        self
    }

    pub fn channel_buffer(mut self, size: usize) -> Self {
        self.config.channel_buffer = size;
        self
    }

    pub fn build(self) -> Result<AttributionAssembler> {
        let mounts = self
            .mounts
            .ok_or_else(|| anyhow::anyhow!("Mount table source is required"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("Container runtime is required"))?;
        let volumes = self
            .volumes
            .ok_or_else(|| anyhow::anyhow!("Volume inventory is required"))?;
        let scheduler = self
            .scheduler
            .ok_or_else(|| anyhow::anyhow!("Measurement scheduler is required"))?;

        Ok(AttributionAssembler::new(
            mounts,
            runtime,
            volumes,
            scheduler,
            self.config,
        ))
    }
}

impl Default for AttributionAssemblerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
