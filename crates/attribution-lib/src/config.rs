//! Engine configuration

use crate::discovery::{DEFAULT_KUBELET_ROOT, DEFAULT_MOUNT_TABLES, DEFAULT_RUNTIME_TIMEOUT};
use crate::host::HostRoot;
use crate::measure::{MeasurePolicy, SchedulerConfig, DEFAULT_EXCLUDED_PATHS, DEFAULT_MEASURE_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to assemble an attribution engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deadline for a single measurement (default: 60 seconds)
    pub measure_timeout: Duration,
    /// Result reuse window (default: 20 seconds, zero disables caching)
    pub cache_ttl: Duration,
    /// Concurrent measurements (default: 6)
    pub max_workers: usize,
    /// Drop `ok` results of zero bytes from the output
    pub skip_zero: bool,
    /// When non-empty, only paths under these roots are measured
    pub allowed_roots: Vec<PathBuf>,
    /// Where the host filesystem is mounted, `None` when running on the host
    pub host_root: Option<PathBuf>,
    pub kubelet_root: PathBuf,
    /// Mount table files, tried in order
    pub mount_tables: Vec<PathBuf>,
    /// Runtime CLI and leading arguments
    pub runtime_command: Vec<String>,
    pub runtime_timeout: Duration,
    /// Size tool and leading arguments, e.g. `nsenter -t 1 -m -- du`
    pub du_command: Vec<String>,
    /// `du_command` runs in the host mount namespace, so it is given host
    /// paths rather than paths under `host_root`
    pub du_in_host_namespace: bool,
    /// Exact paths never measured
    pub excluded_paths: Vec<PathBuf>,
    /// Keep emptyDirs backed by tmpfs
    pub include_memory_backed: bool,
    /// Result channel capacity
    pub channel_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            measure_timeout: DEFAULT_MEASURE_TIMEOUT,
            cache_ttl: Duration::from_secs(20),
            max_workers: 6,
            skip_zero: false,
            allowed_roots: Vec::new(),
            host_root: None,
            kubelet_root: PathBuf::from(DEFAULT_KUBELET_ROOT),
            mount_tables: DEFAULT_MOUNT_TABLES.iter().map(PathBuf::from).collect(),
            runtime_command: vec!["crictl".to_string()],
            runtime_timeout: DEFAULT_RUNTIME_TIMEOUT,
            du_command: vec!["du".to_string()],
            du_in_host_namespace: false,
            excluded_paths: DEFAULT_EXCLUDED_PATHS.iter().map(PathBuf::from).collect(),
            include_memory_backed: false,
            channel_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn host(&self) -> HostRoot {
        match &self.host_root {
            Some(root) => HostRoot::new(root),
            None => HostRoot::identity(),
        }
    }

    pub fn measure_policy(&self) -> MeasurePolicy {
        MeasurePolicy {
            excluded: self.excluded_paths.clone(),
            allowed_roots: self.allowed_roots.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            measure_timeout: self.measure_timeout,
            cache_ttl: self.cache_ttl,
            channel_buffer: self.channel_buffer,
        }
    }
}
