//! Joining overlay mounts with running containers
//!
//! Container IDs are matched against whole path segments of the mountpoint,
//! then of the upperdir. An exact segment match wins. Otherwise a segment that
//! starts with exactly one known ID (at least [`MIN_PREFIX_MATCH`] characters
//! long) is accepted. Mounts matching several IDs are reported as ambiguous
//! rather than guessed.

use crate::models::{ContainerRecord, MountEntry, WritableLayerItem};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Shortest container ID eligible for prefix matching
pub const MIN_PREFIX_MATCH: usize = 12;

/// Outcome of correlating one mount table with one runtime snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    /// Writable layers in mount table order, at most one per container
    pub items: Vec<WritableLayerItem>,
    /// Overlay mounts with an upperdir that matched no running container
    pub unmatched_mounts: usize,
    /// Overlay mounts whose path matched more than one container
    pub ambiguous: usize,
    /// Additional mounts for a container that already has a writable layer
    pub duplicates: usize,
}

enum Match<'a> {
    One(&'a ContainerRecord),
    Ambiguous,
    None,
}

/// Join overlay mounts to the containers they belong to
pub fn correlate<'m>(
    mounts: impl IntoIterator<Item = &'m MountEntry>,
    containers: &[ContainerRecord],
) -> Correlation {
    let by_id: HashMap<&str, &ContainerRecord> = containers
        .iter()
        .filter(|c| !c.container_id.is_empty())
        .map(|c| (c.container_id.as_str(), c))
        .collect();

    let mut correlation = Correlation::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for mount in mounts {
        let Some(upperdir) = mount.upperdir.as_ref() else {
            continue;
        };

        let matched = match find_container(&mount.mountpoint, &by_id) {
            Match::None => find_container(upperdir, &by_id),
            other => other,
        };

        let container = match matched {
            Match::One(container) => container,
            Match::Ambiguous => {
                correlation.ambiguous += 1;
                debug!(mountpoint = %mount.mountpoint.display(), "Overlay mount matches several containers");
                continue;
            }
            Match::None => {
                correlation.unmatched_mounts += 1;
                continue;
            }
        };

        if !seen.insert(container.container_id.as_str()) {
            correlation.duplicates += 1;
            debug!(
                container_id = %container.container_id,
                mountpoint = %mount.mountpoint.display(),
                "Ignoring additional overlay mount for container"
            );
            continue;
        }

        correlation.items.push(WritableLayerItem {
            container_id: container.container_id.clone(),
            upperdir_path: upperdir.clone(),
            mountpoint: mount.mountpoint.clone(),
            pod_name: container.pod_name.clone(),
            container_name: container.container_name.clone(),
            namespace: container.namespace.clone(),
        });
    }

    correlation
}

fn find_container<'a>(path: &Path, by_id: &HashMap<&str, &'a ContainerRecord>) -> Match<'a> {
    let segments: Vec<&str> = path
        .iter()
        .filter_map(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != "/")
        .collect();

    if let Some(container) = segments.iter().find_map(|s| by_id.get(s).copied()) {
        return Match::One(container);
    }

    let mut found: Option<&'a ContainerRecord> = None;
    for segment in &segments {
        for (&id, &container) in by_id {
            if id.len() < MIN_PREFIX_MATCH || !segment.starts_with(id) {
                continue;
            }
            match found {
                Some(prev) if prev.container_id != container.container_id => {
                    return Match::Ambiguous
                }
                _ => found = Some(container),
            }
        }
    }

    found.map_or(Match::None, Match::One)
}
