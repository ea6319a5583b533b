//! Discovery of measurable paths on the node
//!
//! Three independent sources feed attribution: the kernel mount table
//! (overlay writable layers), the container runtime (container and pod
//! names) and the kubelet pod directory (emptyDir volumes). Each can fail on
//! its own without disabling the others.

mod correlate;
mod mounts;
mod runtime;
mod volumes;


pub use correlate::{correlate, Correlation, MIN_PREFIX_MATCH};
pub use mounts::{
    parse_mount_line, parse_mount_table, MountEntries, MountTableSource, DEFAULT_MOUNT_TABLES,
};
pub use runtime::{
    parse_container_descriptions, parse_container_ids, parse_pod_list, ContainerRuntime,
    CrictlClient, RuntimeSnapshot, DEFAULT_RUNTIME_TIMEOUT,
};
pub use volumes::{VolumeInventory, DEFAULT_KUBELET_ROOT};
