//! Error types for discovery, measurement and parsing

use crate::models::DiscoverySource;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of one discovery source. Degrades that source to "no candidates".
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mount table unreadable (tried {tried:?}): {reason}")]
    MountTableUnreadable { tried: Vec<PathBuf>, reason: String },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("runtime command `{command}` exited with {code:?}: {stderr}")]
    RuntimeCommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("runtime command `{command}` timed out after {timeout:?}")]
    RuntimeTimeout { command: String, timeout: Duration },

    #[error("volume root {path} unreadable: {source}")]
    VolumeRootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DiscoveryError {
    /// Which discovery source this error disables
    pub fn source_kind(&self) -> DiscoverySource {
        match self {
            DiscoveryError::MountTableUnreadable { .. } => DiscoverySource::MountTable,
            DiscoveryError::RuntimeUnavailable(_)
            | DiscoveryError::RuntimeCommandFailed { .. }
            | DiscoveryError::RuntimeTimeout { .. } => DiscoverySource::Runtime,
            DiscoveryError::VolumeRootUnreadable { .. } => DiscoverySource::Volumes,
        }
    }
}

/// Failure of a single measurement. Never escapes the prober; it is folded
/// into a `MeasurementResult`.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to spawn size tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("du error (exit {code:?}): {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("unparsable du output: {0:?}")]
    UnparsableOutput(String),

    #[error("measurement timed out after {0:?}")]
    Timeout(Duration),
}

/// A single unparsable input record; skipped and counted by the caller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed mount line: expected {expected} fields, found {found}")]
    MountFieldCount { expected: &'static str, found: usize },

    #[error("malformed mountinfo line: missing ` - ` separator")]
    MissingSeparator,

    #[error("malformed runtime record: {0}")]
    RuntimeRecord(String),
}
