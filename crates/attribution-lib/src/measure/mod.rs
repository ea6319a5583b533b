//! Bounded, cached, de-duplicated path size measurement
//!
//! A [`SizeProber`] measures one path under a deadline. The
//! [`MeasurementScheduler`] runs probes on a bounded worker pool, shares a
//! single probe between concurrent requests for the same path and caches
//! results for a short TTL.

mod cache;
mod prober;
mod scheduler;

pub use cache::{Clock, ManualClock, ResultCache, SystemClock};
pub use prober::DuProber;
pub use scheduler::{MeasurementScheduler, MeasurementStream, ScheduleEvent, SchedulerConfig};

use crate::host::normalize;
use crate::models::MeasurementResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time allowed for a single measurement
pub const DEFAULT_MEASURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Paths never measured by default
pub const DEFAULT_EXCLUDED_PATHS: &[&str] = &["/", "/host"];

/// Measures the on-disk size of a path
#[async_trait]
pub trait SizeProber: Send + Sync {
    /// Measure `path`, giving up once `deadline` has elapsed. Never fails;
    /// every outcome is folded into the returned result.
    async fn measure(&self, path: &Path, deadline: Duration) -> MeasurementResult;

    /// Decide a result without probing, e.g. for excluded paths.
    /// `None` means the path must be measured.
    fn pre_filter(&self, _path: &Path) -> Option<MeasurementResult> {
        None
    }
}

/// Which paths may be measured at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurePolicy {
    /// Exact paths that are reported as skipped
    pub excluded: Vec<PathBuf>,
    /// When non-empty, only paths under one of these roots are measured
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for MeasurePolicy {
    fn default() -> Self {
        Self {
            excluded: DEFAULT_EXCLUDED_PATHS.iter().map(PathBuf::from).collect(),
            allowed_roots: Vec::new(),
        }
    }
}

impl MeasurePolicy {
    /// Result for a path that must not be probed, `None` when it may be
    pub fn check(&self, path: &Path) -> Option<MeasurementResult> {
        if !path.is_absolute() {
            return Some(MeasurementResult::error(
                path,
                "invalid path: not absolute",
                Duration::ZERO,
            ));
        }
        if path.to_string_lossy().contains('\0') {
            return Some(MeasurementResult::error(
                path,
                "invalid path: contains NUL",
                Duration::ZERO,
            ));
        }
        let normal = normalize(path);
        if self.excluded.iter().any(|e| normalize(e) == normal) {
            return Some(MeasurementResult::skipped(path, "excluded path"));
        }
        if !self.allowed_roots.is_empty()
            && !self.allowed_roots.iter().any(|r| is_within(&normal, r))
        {
            return Some(MeasurementResult::skipped(path, "outside allowed roots"));
        }
        None
    }
}

/// Containment after lexical normalization of both sides; a base of `/`
/// contains every absolute path
pub fn is_within(path: &Path, base: &Path) -> bool {
    normalize(path).starts_with(normalize(base))
}
