//! `du`-backed size prober

use super::{MeasurePolicy, SizeProber};
use crate::error::MeasurementError;
use crate::host::{normalize, HostRoot};
use crate::models::MeasurementResult;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

const STDERR_EXCERPT: usize = 80;

/// Measures apparent disk usage with `du -s -x -B1`, confined to one
/// filesystem. The child is killed when the deadline passes.
#[derive(Debug, Clone)]
pub struct DuProber {
    command: Vec<String>,
    host: HostRoot,
    policy: MeasurePolicy,
    /// The command runs in the host mount namespace and gets host paths
    host_namespace: bool,
}

impl DuProber {
    pub fn new(command: Vec<String>, host: HostRoot, policy: MeasurePolicy) -> Self {
        Self {
            command,
            host,
            policy,
            host_namespace: false,
        }
    }

    /// Pass host paths instead of host-root paths to the command, for
    /// wrappers such as `nsenter -t 1 -m -- du`. Existence is still checked
    /// through the host root.
    pub fn with_host_namespace(mut self, enabled: bool) -> Self {
        self.host_namespace = enabled;
        self
    }

    pub fn with_defaults(host: HostRoot) -> Self {
        Self::new(vec!["du".to_string()], host, MeasurePolicy::default())
    }

    pub fn policy(&self) -> &MeasurePolicy {
        &self.policy
    }

    async fn run_du(&self, path: &Path, deadline: Duration) -> Result<u64, MeasurementError> {
        let local = self.host.resolve(path);
        if let Err(e) = tokio::fs::symlink_metadata(&local).await {
            return Err(if e.kind() == ErrorKind::NotFound {
                MeasurementError::NotFound(path.to_path_buf())
            } else {
                MeasurementError::InvalidPath(e.to_string())
            });
        }

        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| MeasurementError::InvalidPath("empty size command".into()))?;

        let target = if self.host_namespace {
            normalize(path)
        } else {
            local
        };

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(["-s", "-x", "-B1", "--"])
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .map_err(|_| MeasurementError::Timeout(deadline))?
            .map_err(MeasurementError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let total = parse_du_total(&stdout);

        // du exits 1 when parts of the tree were unreadable but still prints a total
        match (output.status.code(), total) {
            (Some(0), Some(bytes)) => Ok(bytes),
            (Some(1), Some(bytes)) => {
                debug!(path = %path.display(), "du reported partial errors");
                Ok(bytes)
            }
            (Some(0), None) => Err(MeasurementError::UnparsableOutput(stdout.into_owned())),
            (code, _) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(MeasurementError::ToolFailed {
                    code,
                    stderr: stderr.trim().chars().take(STDERR_EXCERPT).collect(),
                })
            }
        }
    }
}

#[async_trait]
impl SizeProber for DuProber {
    async fn measure(&self, path: &Path, deadline: Duration) -> MeasurementResult {
        if let Some(result) = self.pre_filter(path) {
            return result;
        }

        let started = Instant::now();
        let outcome = self.run_du(path, deadline).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(bytes) => MeasurementResult::ok(path, bytes, elapsed),
            Err(MeasurementError::Timeout(deadline)) => {
                warn!(path = %path.display(), deadline_ms = deadline.as_millis() as u64, "Measurement timed out");
                MeasurementResult::timeout(path, deadline, elapsed)
            }
            Err(MeasurementError::NotFound(_)) => {
                MeasurementResult::error(path, "path not found", elapsed)
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Measurement failed");
                MeasurementResult::error(path, e.to_string(), elapsed)
            }
        }
    }

    fn pre_filter(&self, path: &Path) -> Option<MeasurementResult> {
        self.policy.check(path)
    }
}

/// Total from the first non-empty line of `du -s` output
fn parse_du_total(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .find(|l| !l.trim().is_empty())?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}
