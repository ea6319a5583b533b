//! emptyDir volume enumeration from the kubelet pod directory

use crate::error::DiscoveryError;
use crate::host::HostRoot;
use crate::models::EmptyDirItem;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Default kubelet root directory on the host
pub const DEFAULT_KUBELET_ROOT: &str = "/var/lib/kubelet";

/// Volume plugin directory holding emptyDir volumes
const EMPTY_DIR_PLUGIN: &str = "kubernetes.io~empty-dir";

/// Enumerates `<kubelet_root>/pods/<uid>/volumes/kubernetes.io~empty-dir/<name>`
#[derive(Debug, Clone)]
pub struct VolumeInventory {
    kubelet_root: PathBuf,
    host: HostRoot,
}

impl VolumeInventory {
    pub fn new(kubelet_root: impl Into<PathBuf>, host: HostRoot) -> Self {
        Self {
            kubelet_root: kubelet_root.into(),
            host,
        }
    }

    pub fn kubelet_root(&self) -> &Path {
        &self.kubelet_root
    }

    /// List emptyDir volume directories, sorted by pod UID then volume name.
    /// Paths are reported as host paths. Pods that vanish mid-scan are skipped.
    pub async fn list(&self) -> Result<Vec<EmptyDirItem>, DiscoveryError> {
        let pods_root = self.kubelet_root.join("pods");
        let local_pods_root = self.host.resolve(&pods_root);

        let mut pods = fs::read_dir(&local_pods_root).await.map_err(|source| {
            DiscoveryError::VolumeRootUnreadable {
                path: pods_root.clone(),
                source,
            }
        })?;

        let mut items = Vec::new();
        loop {
            let pod = match pods.next_entry().await {
                Ok(Some(pod)) => pod,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %local_pods_root.display(), error = %e, "Pod directory listing interrupted");
                    break;
                }
            };

            let Some(pod_uid) = pod.file_name().to_str().map(str::to_string) else {
                debug!(name = ?pod.file_name(), "Skipping non UTF-8 pod directory");
                continue;
            };

            let plugin_dir = pods_root.join(&pod_uid).join("volumes").join(EMPTY_DIR_PLUGIN);
            items.extend(self.list_pod(&pod_uid, &plugin_dir).await);
        }

        items.sort_by(|a, b| {
            a.pod_uid
                .cmp(&b.pod_uid)
                .then_with(|| a.volume_name.cmp(&b.volume_name))
        });

        debug!(volumes = items.len(), "Enumerated emptyDir volumes");
        Ok(items)
    }

    async fn list_pod(&self, pod_uid: &str, plugin_dir: &Path) -> Vec<EmptyDirItem> {
        let local_dir = self.host.resolve(plugin_dir);
        let mut volumes = match fs::read_dir(&local_dir).await {
            Ok(volumes) => volumes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                debug!(path = %local_dir.display(), error = %e, "Skipping unreadable emptyDir plugin directory");
                return Vec::new();
            }
        };

        let mut items = Vec::new();
        while let Ok(Some(volume)) = volumes.next_entry().await {
            let is_dir = volume
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(volume_name) = volume.file_name().to_str().map(str::to_string) else {
                continue;
            };

            items.push(EmptyDirItem {
                pod_uid: pod_uid.to_string(),
                path: plugin_dir.join(&volume_name),
                volume_name,
                pod_name: None,
                namespace: None,
            });
        }
        items
    }
}
