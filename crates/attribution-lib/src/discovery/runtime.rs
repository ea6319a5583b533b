//! Container runtime introspection through `crictl`
//!
//! Two-step protocol: `crictl ps -q` lists the running container IDs, then
//! `crictl ps --output=json` describes them in one batch. The ID list is
//! authoritative; a container missing from the description keeps its ID with
//! unknown names.

use crate::error::{DiscoveryError, ParseError};
use crate::models::{ContainerRecord, PodRecord};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default timeout for a single runtime command
pub const DEFAULT_RUNTIME_TIMEOUT: Duration = Duration::from_secs(10);

const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

/// Longest stderr excerpt kept in errors
const STDERR_EXCERPT: usize = 200;

/// Running containers as seen by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub containers: Vec<ContainerRecord>,
    /// Malformed description records that were skipped
    pub skipped_records: usize,
    /// Listed containers that had no usable description
    pub undescribed: usize,
}

/// Source of running container and pod sandbox information
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers with pod/container names where known
    async fn list_containers(&self) -> Result<RuntimeSnapshot, DiscoveryError>;

    /// List pod sandboxes
    async fn list_pods(&self) -> Result<Vec<PodRecord>, DiscoveryError>;

    /// Where container information comes from, used in failure records
    fn endpoint(&self) -> String {
        "container runtime".to_string()
    }
}

/// `crictl`-backed runtime client
#[derive(Debug, Clone)]
pub struct CrictlClient {
    /// Program and leading arguments, e.g. `crictl --runtime-endpoint unix:///...`
    command: Vec<String>,
    timeout: Duration,
}

impl CrictlClient {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn with_defaults() -> Self {
        Self::new(vec!["crictl".to_string()], DEFAULT_RUNTIME_TIMEOUT)
    }

    fn command_line(&self, args: &[&str]) -> String {
        self.command
            .iter()
            .map(String::as_str)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run one runtime command and return its stdout
    async fn run(&self, args: &[&str]) -> Result<String, DiscoveryError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| DiscoveryError::RuntimeUnavailable("empty runtime command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command = self.command_line(args);
        debug!(command = %command, "Running runtime command");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return Err(DiscoveryError::RuntimeTimeout {
                    command,
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => {
                let reason = match e.kind() {
                    ErrorKind::NotFound => format!("{} not found", program),
                    ErrorKind::PermissionDenied => format!("{} is not executable", program),
                    _ => format!("failed to execute {}: {}", program, e),
                };
                return Err(DiscoveryError::RuntimeUnavailable(reason));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DiscoveryError::RuntimeCommandFailed {
                command,
                code: output.status.code(),
                stderr: excerpt(stderr.trim(), STDERR_EXCERPT),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for CrictlClient {
    async fn list_containers(&self) -> Result<RuntimeSnapshot, DiscoveryError> {
        let ids = parse_container_ids(&self.run(&["ps", "-q"]).await?);
        if ids.is_empty() {
            return Ok(RuntimeSnapshot::default());
        }

        let (mut described, skipped_records) = match self.run(&["ps", "--output=json"]).await {
            Ok(text) => match parse_container_descriptions(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Unparsable container descriptions, names unknown");
                    (HashMap::new(), 0)
                }
            },
            Err(e) => {
                warn!(error = %e, "Container describe failed, names unknown");
                (HashMap::new(), 0)
            }
        };

        let mut snapshot = RuntimeSnapshot {
            skipped_records,
            ..Default::default()
        };
        for id in ids {
            match described.remove(&id) {
                Some(record) => snapshot.containers.push(record),
                None => {
                    snapshot.undescribed += 1;
                    snapshot.containers.push(ContainerRecord::unknown(id));
                }
            }
        }

        debug!(
            containers = snapshot.containers.len(),
            undescribed = snapshot.undescribed,
            skipped_records = snapshot.skipped_records,
            "Listed running containers"
        );
        Ok(snapshot)
    }

    async fn list_pods(&self) -> Result<Vec<PodRecord>, DiscoveryError> {
        let text = self.run(&["pods", "--output=json"]).await?;
        let (pods, skipped) = parse_pod_list(&text).map_err(|e| {
            DiscoveryError::RuntimeUnavailable(format!("unparsable pod list: {}", e))
        })?;
        if skipped > 0 {
            debug!(skipped, "Skipped malformed pod records");
        }
        Ok(pods)
    }

    fn endpoint(&self) -> String {
        self.command.join(" ")
    }
}

/// Parse newline-separated container IDs, preserving order and dropping duplicates
pub fn parse_container_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !ids.iter().any(|id| id == line) {
            ids.push(line.to_string());
        }
    }
    ids
}

/// Describe output: `{"containers": [...]}` or a bare array
#[derive(Deserialize)]
#[serde(untagged)]
enum DescribeDocument {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(default)]
        containers: Vec<Value>,
    },
}

#[derive(Deserialize)]
struct DescribedContainer {
    id: String,
    #[serde(default)]
    metadata: Option<ContainerMetadata>,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default, rename = "podSandboxId")]
    pod_sandbox_id: Option<String>,
}

#[derive(Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    name: Option<String>,
}

impl DescribedContainer {
    fn into_record(mut self) -> ContainerRecord {
        let container_name = self
            .metadata
            .and_then(|m| m.name)
            .or_else(|| self.labels.remove(CONTAINER_NAME_LABEL))
            .filter(|n| !n.is_empty());

        ContainerRecord {
            container_id: self.id,
            pod_name: take_label(&mut self.labels, POD_NAME_LABEL),
            container_name,
            namespace: take_label(&mut self.labels, POD_NAMESPACE_LABEL),
            pod_uid: take_label(&mut self.labels, POD_UID_LABEL),
            pod_sandbox_id: self.pod_sandbox_id.filter(|s| !s.is_empty()),
        }
    }
}

fn take_label(labels: &mut HashMap<String, String>, key: &str) -> Option<String> {
    labels.remove(key).filter(|v| !v.is_empty())
}

/// Parse the batch describe output into records keyed by container ID.
/// Returns the records and the number of malformed entries skipped.
pub fn parse_container_descriptions(
    text: &str,
) -> Result<(HashMap<String, ContainerRecord>, usize), ParseError> {
    if text.trim().is_empty() {
        return Ok((HashMap::new(), 0));
    }

    let document: DescribeDocument =
        serde_json::from_str(text).map_err(|e| ParseError::RuntimeRecord(e.to_string()))?;
    let entries = match document {
        DescribeDocument::Bare(entries) => entries,
        DescribeDocument::Wrapped { containers } => containers,
    };

    let mut records = HashMap::with_capacity(entries.len());
    let mut skipped = 0;
    for entry in entries {
        match serde_json::from_value::<DescribedContainer>(entry) {
            Ok(described) if !described.id.is_empty() => {
                let record = described.into_record();
                records.insert(record.container_id.clone(), record);
            }
            Ok(_) => {
                skipped += 1;
                debug!("Skipping container record with empty id");
            }
            Err(e) => {
                skipped += 1;
                debug!(error = %e, "Skipping malformed container record");
            }
        }
    }

    Ok((records, skipped))
}

#[derive(Deserialize)]
struct PodDocument {
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct DescribedPod {
    id: String,
    metadata: PodMetadata,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: String,
    uid: String,
    #[serde(default)]
    namespace: String,
}

/// Parse `crictl pods --output=json`. Returns pods and the number skipped.
pub fn parse_pod_list(text: &str) -> Result<(Vec<PodRecord>, usize), ParseError> {
    if text.trim().is_empty() {
        return Ok((Vec::new(), 0));
    }

    let document: PodDocument =
        serde_json::from_str(text).map_err(|e| ParseError::RuntimeRecord(e.to_string()))?;

    let mut pods = Vec::with_capacity(document.items.len());
    let mut skipped = 0;
    for item in document.items {
        match serde_json::from_value::<DescribedPod>(item) {
            Ok(pod) => pods.push(PodRecord {
                sandbox_id: pod.id,
                uid: pod.metadata.uid,
                name: pod.metadata.name,
                namespace: pod.metadata.namespace,
            }),
            Err(e) => {
                skipped += 1;
                debug!(error = %e, "Skipping malformed pod record");
            }
        }
    }

    Ok((pods, skipped))
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
