//! End-to-end attribution tests
//!
//! Discovery reads a mount table and kubelet tree from a temp directory; the
//! container runtime and, where timing matters, the prober are faked.

#[cfg(test)]
mod attribution_run_tests {
    use crate::attribution::{
        AttributionAssembler, AttributionAssemblerBuilder, AttributionEvent, AttributionLoop,
    };
    use crate::discovery::{ContainerRuntime, MountTableSource, RuntimeSnapshot, VolumeInventory};
    use crate::error::DiscoveryError;
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::host::HostRoot;
    use crate::measure::{
        DuProber, MeasurePolicy, MeasurementScheduler, SchedulerConfig, SizeProber,
    };
    use crate::models::{
        Attribution, ContainerRecord, MeasurementResult, MeasurementStatus, PodRecord,
    };
    use crate::observability::StructuredLogger;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::fs;

    const EMPTY_DIR: &str = "volumes/kubernetes.io~empty-dir";
    const UPPERDIR: &str = "/var/lib/containerd/snapshots/42/fs";

    struct FakeRuntime {
        containers: Vec<ContainerRecord>,
        pods: Vec<PodRecord>,
        available: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_containers(&self) -> Result<RuntimeSnapshot, DiscoveryError> {
            if !self.available {
                return Err(DiscoveryError::RuntimeUnavailable("crictl not found".into()));
            }
            Ok(RuntimeSnapshot {
                containers: self.containers.clone(),
                ..Default::default()
            })
        }

        async fn list_pods(&self) -> Result<Vec<PodRecord>, DiscoveryError> {
            Ok(self.pods.clone())
        }

        fn endpoint(&self) -> String {
            "crictl".to_string()
        }
    }

    /// Reports a fixed size per path without touching the filesystem
    struct SizedProber {
        sizes: HashMap<PathBuf, u64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SizeProber for SizedProber {
        async fn measure(&self, path: &Path, _deadline: Duration) -> MeasurementResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.sizes.get(path) {
                Some(bytes) => MeasurementResult::ok(path, *bytes, Duration::from_millis(1)),
                None => MeasurementResult::error(path, "path not found", Duration::ZERO),
            }
        }
    }

    struct Node {
        _temp: TempDir,
        mount_table: PathBuf,
        kubelet_root: PathBuf,
    }

    impl Node {
        fn volume(&self, uid: &str, name: &str) -> PathBuf {
            self.kubelet_root
                .join("pods")
                .join(uid)
                .join(EMPTY_DIR)
                .join(name)
        }
    }

    /// Node with one containerd overlay mount for `abc123` and two emptyDirs
    /// of pod `uid-1`; `extra_mounts` is appended to the mount table
    async fn node(extra_mounts: &str) -> Node {
        let temp = TempDir::new().unwrap();
        let kubelet_root = temp.path().join("kubelet");
        for name in ["cache", "dshm"] {
            fs::create_dir_all(kubelet_root.join("pods/uid-1").join(EMPTY_DIR).join(name))
                .await
                .unwrap();
        }

        let mount_table = temp.path().join("mounts");
        let text = format!(
            "proc /proc proc rw 0 0\n\
             overlay /run/containerd/io.containerd.runtime.v2.task/k8s.io/abc123/rootfs overlay rw,relatime,lowerdir=/l1:/l2,upperdir={},workdir=/w 0 0\n\
             {}",
            UPPERDIR, extra_mounts
        );
        fs::write(&mount_table, text).await.unwrap();

        Node {
            _temp: temp,
            mount_table,
            kubelet_root,
        }
    }

    fn web_runtime(available: bool) -> FakeRuntime {
        FakeRuntime {
            containers: vec![ContainerRecord {
                container_id: "abc123".to_string(),
                pod_name: Some("web-7d9f-xyz".to_string()),
                container_name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                pod_uid: None,
                pod_sandbox_id: Some("sb1".to_string()),
            }],
            pods: vec![PodRecord {
                sandbox_id: "sb1".to_string(),
                uid: "uid-1".to_string(),
                name: "web-7d9f-xyz".to_string(),
                namespace: "default".to_string(),
            }],
            available,
        }
    }

    fn assembler(
        node: &Node,
        runtime: FakeRuntime,
        prober: Arc<dyn SizeProber>,
        skip_zero: bool,
    ) -> AttributionAssembler {
        AttributionAssemblerBuilder::new()
            .mounts(MountTableSource::new(
                vec![node.mount_table.clone()],
                HostRoot::identity(),
            ))
            .runtime(Arc::new(runtime))
            .volumes(VolumeInventory::new(&node.kubelet_root, HostRoot::identity()))
            .scheduler(Arc::new(MeasurementScheduler::new(
                prober,
                SchedulerConfig::default(),
            )))
            .skip_zero(skip_zero)
            .build()
            .unwrap()
    }

    fn sized(sizes: Vec<(PathBuf, u64)>) -> Arc<SizedProber> {
        Arc::new(SizedProber {
            sizes: sizes.into_iter().collect(),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_writable_layer_attributed_to_pod_and_container() {
        let node = node("").await;
        let prober = sized(vec![
            (PathBuf::from(UPPERDIR), 5 * 1024 * 1024),
            (node.volume("uid-1", "cache"), 4096),
            (node.volume("uid-1", "dshm"), 0),
        ]);
        let assembler = assembler(&node, web_runtime(true), prober, false);

        let (records, summary) = assembler.run().collect().await;

        assert_eq!(records.len(), 3);
        let layer = records
            .iter()
            .find_map(|r| match &r.attribution {
                Attribution::Overlay(item) => Some((item, &r.result)),
                _ => None,
            })
            .unwrap();
        assert_eq!(layer.0.container_id, "abc123");
        assert_eq!(layer.0.pod_name.as_deref(), Some("web-7d9f-xyz"));
        assert_eq!(layer.0.container_name.as_deref(), Some("web"));
        assert_eq!(layer.1.bytes, Some(5 * 1024 * 1024));
        assert_eq!(layer.1.human_readable, "5.0 MiB");

        let volumes: Vec<_> = records
            .iter()
            .filter_map(|r| match &r.attribution {
                Attribution::EmptyDir(item) => Some(item),
                _ => None,
            })
            .collect();
        assert_eq!(volumes.len(), 2);
        assert!(volumes
            .iter()
            .all(|v| v.pod_name.as_deref() == Some("web-7d9f-xyz")));

        assert_eq!(summary.writable_layers, 1);
        assert_eq!(summary.empty_dirs, 2);
        assert_eq!(summary.total_bytes, 5 * 1024 * 1024 + 4096);
        assert_eq!(summary.skipped_mount_lines, 0);
        assert!(!summary.cancelled);
        assert!(summary.warning.is_none());
    }

    #[tokio::test]
    async fn test_skip_zero_excludes_empty_results() {
        let node = node("").await;
        let prober = sized(vec![
            (PathBuf::from(UPPERDIR), 100),
            (node.volume("uid-1", "cache"), 0),
            (node.volume("uid-1", "dshm"), 0),
        ]);
        let assembler = assembler(&node, web_runtime(true), prober, true);

        let (records, summary) = assembler.run().collect().await;

        assert_eq!(records.len(), 1);
        assert_eq!(summary.zero_excluded, 2);
        assert_eq!(summary.total_bytes, 100);
    }

    #[tokio::test]
    async fn test_run_as_json_event_stream() {
        use tokio_stream::StreamExt;

        let node = node("").await;
        let prober = sized(vec![
            (PathBuf::from(UPPERDIR), 2048),
            (node.volume("uid-1", "cache"), 1024),
            (node.volume("uid-1", "dshm"), 0),
        ]);
        let assembler = assembler(&node, web_runtime(true), prober, false);

        let events: Vec<AttributionEvent> = assembler.run().into_stream().collect().await;

        assert_eq!(events.len(), 4);
        let lines: Vec<serde_json::Value> = events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect();
        assert!(lines[..3].iter().all(|l| l["event"] == "record"));
        assert_eq!(lines[3]["event"], "completed");
        assert_eq!(lines[3]["data"]["total_bytes"], 3072);
        assert!(matches!(events.last(), Some(AttributionEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_runtime_failure_still_measures_volumes() {
        let node = node("").await;
        let prober = sized(vec![
            (node.volume("uid-1", "cache"), 10),
            (node.volume("uid-1", "dshm"), 20),
        ]);
        let assembler = assembler(&node, web_runtime(false), prober, false);

        let (records, summary) = assembler.run().collect().await;

        let failure = records
            .iter()
            .find(|r| matches!(r.attribution, Attribution::DiscoveryFailure { .. }))
            .unwrap();
        assert_eq!(failure.result.status, MeasurementStatus::Error);
        assert_eq!(failure.result.path, PathBuf::from("crictl"));
        assert!(failure
            .result
            .detail
            .as_deref()
            .unwrap()
            .contains("crictl not found"));

        assert_eq!(summary.discovery_failures, 1);
        assert_eq!(summary.writable_layers, 0);
        assert_eq!(summary.empty_dirs, 2);
        assert_eq!(summary.total_bytes, 30);
        assert!(summary.warning.is_none());
    }

    #[tokio::test]
    async fn test_all_sources_failing_warns() {
        let temp = TempDir::new().unwrap();
        let assembler = AttributionAssemblerBuilder::new()
            .mounts(MountTableSource::new(
                vec![temp.path().join("no-mounts")],
                HostRoot::identity(),
            ))
            .runtime(Arc::new(web_runtime(false)))
            .volumes(VolumeInventory::new(
                temp.path().join("no-kubelet"),
                HostRoot::identity(),
            ))
            .scheduler(Arc::new(MeasurementScheduler::new(
                sized(vec![]),
                SchedulerConfig::default(),
            )))
            .build()
            .unwrap();

        let (records, summary) = assembler.run().collect().await;

        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.result.status == MeasurementStatus::Error));
        assert_eq!(summary.discovery_failures, 3);
        assert_eq!(
            summary.warning.as_deref(),
            Some("all discovery sources failed")
        );
    }

    #[tokio::test]
    async fn test_memory_backed_empty_dir_excluded() {
        let node = node("").await;
        let dshm = node.volume("uid-1", "dshm");
        fs::write(
            &node.mount_table,
            format!(
                "{}tmpfs {} tmpfs rw,size=65536k 0 0\n",
                fs::read_to_string(&node.mount_table).await.unwrap(),
                dshm.display()
            ),
        )
        .await
        .unwrap();

        let assembler = assembler(&node, web_runtime(true), sized(vec![]), false);
        let discovery = assembler.discover().await;

        assert_eq!(discovery.diagnostics.memory_backed_excluded, 1);
        assert!(discovery.candidates.iter().all(|c| c.path != dshm));
        assert_eq!(discovery.candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_discovery_is_identical() {
        let node = node("garbage line\n").await;
        let assembler = assembler(&node, web_runtime(true), sized(vec![]), false);

        let first = assembler.discover().await;
        let second = assembler.discover().await;

        assert_eq!(first, second);
        assert_eq!(first.diagnostics.skipped_mount_lines, 1);
    }

    #[tokio::test]
    async fn test_resubmission_served_from_cache() {
        let node = node("").await;
        let prober = sized(vec![(PathBuf::from(UPPERDIR), 1)]);
        let assembler = assembler(&node, web_runtime(true), prober.clone(), false);

        assembler.run().collect().await;
        let first_calls = prober.calls.load(Ordering::SeqCst);
        assembler.run().collect().await;

        assert_eq!(first_calls, 3);
        assert_eq!(prober.calls.load(Ordering::SeqCst), first_calls);
    }

    #[tokio::test]
    async fn test_records_serialize_one_per_line() {
        let node = node("").await;
        let assembler = assembler(&node, web_runtime(true), sized(vec![]), false);

        let mut run = assembler.run();
        while let Some(event) = run.next().await {
            let line = serde_json::to_string(&event).unwrap();
            assert!(!line.contains('\n'));
            let back: AttributionEvent = serde_json::from_str(&line).unwrap();
            assert_eq!(back, event);
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_vanished_volume_is_error_and_run_continues() {
        let node = node("").await;
        let assembler = assembler(
            &node,
            web_runtime(true),
            Arc::new(DuProber::new(
                vec!["du".to_string()],
                HostRoot::identity(),
                MeasurePolicy::default(),
            )),
            false,
        );

        let discovery = assembler.discover().await;
        let dshm = node.volume("uid-1", "dshm");
        fs::remove_dir_all(&dshm).await.unwrap();

        let emptydirs = discovery
            .candidates
            .into_iter()
            .filter(|c| matches!(c.attribution, Attribution::EmptyDir(_)))
            .collect();
        let mut stream = assembler.scheduler().submit(emptydirs);

        let mut results = HashMap::new();
        while let Some(event) = stream.next().await {
            if let crate::measure::ScheduleEvent::Measured(record) = event {
                results.insert(record.result.path.clone(), record.result);
            }
        }

        assert_eq!(results[&dshm].status, MeasurementStatus::Error);
        assert_eq!(results[&dshm].bytes, None);
        assert_eq!(
            results[&node.volume("uid-1", "cache")].status,
            MeasurementStatus::Ok
        );
    }

    #[tokio::test]
    async fn test_loop_run_updates_health() {
        let node = node("").await;
        let assembler = assembler(&node, web_runtime(false), sized(vec![]), false);
        let health = HealthRegistry::new();
        for name in components::ALL {
            health.register(name).await;
        }

        let attribution_loop =
            AttributionLoop::new(assembler, Duration::from_secs(300), StructuredLogger::new("node-a"))
                .with_health(health.clone());
        let summary = attribution_loop.run_once(1).await;

        assert_eq!(summary.discovery_failures, 1);
        let report = health.health().await;
        assert_eq!(report.status, ComponentStatus::Degraded);
        assert_eq!(
            report.components[components::RUNTIME].status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            report.components[components::VOLUMES].status,
            ComponentStatus::Healthy
        );
        assert!(report.last_run.is_some());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let node = node("").await;
        let assembler = assembler(&node, web_runtime(true), sized(vec![]), false);
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(
            AttributionLoop::new(assembler, Duration::from_secs(300), StructuredLogger::new("node-a"))
                .run(shutdown_rx),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
