//! Host filesystem view
//!
//! The agent usually runs in a container with the node's root filesystem
//! mounted at some prefix (commonly `/host`). Every path the engine reports is
//! a host path; `HostRoot` maps it to the path visible inside the container.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRoot {
    root: Option<PathBuf>,
}

impl HostRoot {
    /// Host filesystem mounted at `root`. A root of `/` is the identity mapping.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if root == Path::new("/") || root.as_os_str().is_empty() {
            return Self::identity();
        }
        Self { root: Some(root) }
    }

    /// Agent runs directly on the host
    pub fn identity() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Map a host path to the locally visible path. The host path is
    /// normalized first, so the result never leaves the root. Paths are
    /// always taken as host paths, even when they already begin with the root.
    pub fn resolve(&self, host_path: &Path) -> PathBuf {
        let host_path = normalize(host_path);
        let Some(root) = &self.root else {
            return host_path;
        };

        let relative: PathBuf = host_path
            .components()
            .filter(|c| {
                !matches!(
                    c,
                    Component::RootDir | Component::Prefix(_) | Component::ParentDir
                )
            })
            .collect();
        root.join(relative)
    }
}

/// Lexical normalization: drops `.` and folds `..` into its parent.
/// `..` never climbs above the root of an absolute path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}
