//! Short-lived measurement result cache

use crate::models::MeasurementResult;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: MeasurementResult,
    expires_at: Instant,
}

/// Path-keyed result cache with per-entry expiry. Expired entries are
/// evicted lazily on lookup.
pub struct ResultCache {
    entries: DashMap<PathBuf, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Fresh cached result for `path`, if any
    pub fn get(&self, path: &Path) -> Option<MeasurementResult> {
        let now = self.clock.now();
        {
            let entry = self.entries.get(path)?;
            if entry.expires_at > now {
                return Some(entry.result.clone());
            }
        }
        self.entries.remove_if(path, |_, e| e.expires_at <= now);
        None
    }

    /// Store `result` for `ttl`. A zero TTL disables caching.
    pub fn put(&self, path: &Path, result: MeasurementResult, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(path.to_path_buf(), CacheEntry { result, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = ResultCache::with_clock(clock.clone());
        let path = Path::new("/var/lib/x");

        cache.put(path, MeasurementResult::ok(path, 10, Duration::ZERO), Duration::from_secs(20));
        clock.advance(Duration::from_secs(19));
        assert_eq!(cache.get(path).and_then(|r| r.bytes), Some(10));

        clock.advance(Duration::from_secs(1));
        assert!(cache.get(path).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = ResultCache::new();
        let path = Path::new("/a");
        cache.put(path, MeasurementResult::ok(path, 1, Duration::ZERO), Duration::ZERO);
        assert!(cache.get(path).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_put_replaces_entry() {
        let cache = ResultCache::new();
        let path = Path::new("/a");
        cache.put(path, MeasurementResult::ok(path, 1, Duration::ZERO), Duration::from_secs(5));
        cache.put(path, MeasurementResult::ok(path, 2, Duration::ZERO), Duration::from_secs(5));
        assert_eq!(cache.get(path).and_then(|r| r.bytes), Some(2));
        assert_eq!(cache.len(), 1);
    }
}
