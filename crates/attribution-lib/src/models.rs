//! Core data models for the storage attribution engine

use crate::size::format_bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One parsed line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
    /// Writable layer of an overlay mount, absent for every other filesystem
    pub upperdir: Option<PathBuf>,
}

impl MountEntry {
    pub fn is_overlay(&self) -> bool {
        self.fstype == "overlay" || self.device == "overlay"
    }
}

/// A running container as reported by the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    pub pod_name: Option<String>,
    pub container_name: Option<String>,
    pub namespace: Option<String>,
    pub pod_uid: Option<String>,
    pub pod_sandbox_id: Option<String>,
}

impl ContainerRecord {
    /// Record for a listed container whose description could not be obtained
    pub fn unknown(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            pod_name: None,
            container_name: None,
            namespace: None,
            pod_uid: None,
            pod_sandbox_id: None,
        }
    }
}

/// A pod sandbox as reported by the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub sandbox_id: String,
    pub uid: String,
    pub name: String,
    pub namespace: String,
}

/// Container writable layer: an overlay upperdir joined with its container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritableLayerItem {
    pub container_id: String,
    pub upperdir_path: PathBuf,
    pub mountpoint: PathBuf,
    pub pod_name: Option<String>,
    pub container_name: Option<String>,
    pub namespace: Option<String>,
}

/// Disk-backed emptyDir volume directory of a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyDirItem {
    pub pod_uid: String,
    pub volume_name: String,
    pub path: PathBuf,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
}

/// Discovery source that can fail independently of the others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    MountTable,
    Runtime,
    Volumes,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::MountTable => "mount_table",
            DiscoverySource::Runtime => "runtime",
            DiscoverySource::Volumes => "volumes",
        }
    }
}

/// What a measured path is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attribution {
    Overlay(WritableLayerItem),
    #[serde(rename = "emptydir")]
    EmptyDir(EmptyDirItem),
    DiscoveryFailure {
        source: DiscoverySource,
        message: String,
    },
}

impl Attribution {
    pub fn kind(&self) -> &'static str {
        match self {
            Attribution::Overlay(_) => "overlay",
            Attribution::EmptyDir(_) => "emptydir",
            Attribution::DiscoveryFailure { .. } => "discovery_failure",
        }
    }

    pub fn pod_name(&self) -> Option<&str> {
        match self {
            Attribution::Overlay(item) => item.pod_name.as_deref(),
            Attribution::EmptyDir(item) => item.pod_name.as_deref(),
            Attribution::DiscoveryFailure { .. } => None,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Attribution::Overlay(item) => item.namespace.as_deref(),
            Attribution::EmptyDir(item) => item.namespace.as_deref(),
            Attribution::DiscoveryFailure { .. } => None,
        }
    }
}

/// A path pending measurement, with the metadata it is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub attribution: Attribution,
}

impl Candidate {
    pub fn writable_layer(item: WritableLayerItem) -> Self {
        Self {
            path: item.upperdir_path.clone(),
            attribution: Attribution::Overlay(item),
        }
    }

    pub fn empty_dir(item: EmptyDirItem) -> Self {
        Self {
            path: item.path.clone(),
            attribution: Attribution::EmptyDir(item),
        }
    }
}

/// Outcome class of a single measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementStatus {
    Ok,
    Error,
    Timeout,
    Skipped,
}

impl MeasurementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementStatus::Ok => "ok",
            MeasurementStatus::Error => "error",
            MeasurementStatus::Timeout => "timeout",
            MeasurementStatus::Skipped => "skipped",
        }
    }
}

/// Result of measuring one path. `bytes` is only set when `status` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub path: PathBuf,
    pub bytes: Option<u64>,
    pub status: MeasurementStatus,
    pub human_readable: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MeasurementResult {
    pub fn ok(path: impl Into<PathBuf>, bytes: u64, elapsed: Duration) -> Self {
        Self {
            path: path.into(),
            bytes: Some(bytes),
            status: MeasurementStatus::Ok,
            human_readable: format_bytes(bytes),
            elapsed_ms: elapsed.as_millis() as u64,
            detail: None,
        }
    }

    pub fn error(path: impl Into<PathBuf>, detail: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            path: path.into(),
            bytes: None,
            status: MeasurementStatus::Error,
            human_readable: "-".to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            detail: Some(detail.into()),
        }
    }

    pub fn timeout(path: impl Into<PathBuf>, deadline: Duration, elapsed: Duration) -> Self {
        Self {
            path: path.into(),
            bytes: None,
            status: MeasurementStatus::Timeout,
            human_readable: format!("Timeout ({}s)", deadline.as_secs()),
            elapsed_ms: elapsed.as_millis() as u64,
            detail: Some(format!(
                "measurement exceeded deadline of {}ms",
                deadline.as_millis()
            )),
        }
    }

    pub fn skipped(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bytes: None,
            status: MeasurementStatus::Skipped,
            human_readable: "N/A".to_string(),
            elapsed_ms: 0,
            detail: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == MeasurementStatus::Ok
    }

    /// True for an `ok` measurement of zero bytes
    pub fn is_zero(&self) -> bool {
        self.is_ok() && self.bytes == Some(0)
    }
}

/// One streamed attribution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub attribution: Attribution,
    pub result: MeasurementResult,
}

/// End-of-run summary of an attribution cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: i64,
    pub elapsed_ms: u64,
    pub writable_layers: usize,
    pub empty_dirs: usize,
    pub total_bytes: u64,
    pub ok: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub skipped: usize,
    pub discovery_failures: usize,
    pub zero_excluded: usize,
    pub memory_backed_excluded: usize,
    pub skipped_mount_lines: usize,
    pub skipped_runtime_records: usize,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl RunSummary {
    /// Fold one emitted record into the summary
    pub fn record(&mut self, record: &AttributionRecord) {
        match &record.attribution {
            Attribution::Overlay(_) => self.writable_layers += 1,
            Attribution::EmptyDir(_) => self.empty_dirs += 1,
            Attribution::DiscoveryFailure { .. } => self.discovery_failures += 1,
        }

        match record.result.status {
            MeasurementStatus::Ok => {
                self.ok += 1;
                self.total_bytes += record.result.bytes.unwrap_or(0);
            }
            MeasurementStatus::Error => self.errors += 1,
            MeasurementStatus::Timeout => self.timeouts += 1,
            MeasurementStatus::Skipped => self.skipped += 1,
        }
    }
}
