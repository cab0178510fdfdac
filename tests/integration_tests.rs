//! Share Manager Integration Tests
//!
//! End-to-end lifecycle of one share manager instance against in-memory
//! host adapters:
//! - Plain and encrypted volume export and teardown
//! - Fast failover lease hand-over between two nodes
//! - Control API server and client over TCP

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;
use tokio::net::TcpListener;

use share_manager::adapters::{FakeCryptoDevice, FakeMounter, FakeNfsDaemon, InMemoryLeaseStore};
use share_manager::domain::LeaseRecord;
use share_manager::{
    Dependencies, Error, LeaseCoordinator, ManagerConfig, ShareManager, ShareState,
    VolumeDescriptor,
};

struct Instance {
    dir: TempDir,
    mounter: Arc<FakeMounter>,
    crypto: Arc<FakeCryptoDevice>,
    daemon: Arc<FakeNfsDaemon>,
    manager: Arc<ShareManager>,
}

impl Instance {
    fn new(volume: VolumeDescriptor, lease: Option<Arc<LeaseCoordinator>>) -> Self {
        Self::with_renew_interval(volume, lease, Duration::from_millis(10))
    }

    fn with_renew_interval(
        volume: VolumeDescriptor,
        lease: Option<Arc<LeaseCoordinator>>,
        lease_renew_interval: Duration,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter::new());
        let crypto = Arc::new(FakeCryptoDevice::new(mounter.clone()));
        let daemon = Arc::new(FakeNfsDaemon::new());
        let config = ManagerConfig {
            wait_between_checks: Duration::from_millis(10),
            lease_renew_interval,
            health_check_interval: Duration::from_millis(10),
            config_path: dir.path().join("vfs.conf"),
            ..Default::default()
        };
        let deps = Dependencies {
            mounter: mounter.clone(),
            crypto: crypto.clone(),
            daemon: daemon.clone(),
            lease,
        };
        let manager = ShareManager::new(volume, config, deps).unwrap();
        Self {
            dir,
            mounter,
            crypto,
            daemon,
            manager,
        }
    }

    fn config_contents(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("vfs.conf")).unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn has_export_for(config: &str, path: &Path) -> bool {
    config.contains(&format!("Path = {};", path.display()))
}

// =============================================================================
// Volume Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_volume_export_and_delete() {
        let instance = Instance::new(VolumeDescriptor::new("vol-a", "ext4"), None);
        let mount_path = Path::new("/export/vol-a");

        // The export entry is written before the device shows up
        assert!(has_export_for(&instance.config_contents(), mount_path));
        assert_eq!(instance.manager.status().export_id, 1);
        assert_eq!(instance.manager.status().state, ShareState::Pending);

        let handle = tokio::spawn(instance.manager.clone().run());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(instance.daemon.starts(), 0);

        instance.mounter.attach_device("/dev/longhorn/vol-a");
        let (daemon, manager) = (instance.daemon.clone(), instance.manager.clone());
        wait_until(move || daemon.is_running() && manager.status().state == ShareState::Ready).await;

        let (source, fs_type) = instance.mounter.mounted_at(mount_path).unwrap();
        assert_eq!(source, Path::new("/dev/longhorn/vol-a"));
        assert_eq!(fs_type, "ext4");
        assert_eq!(instance.mounter.permissions(mount_path), Some(0o777));
        assert_eq!(instance.mounter.format_calls(), 1);
        assert!(instance.manager.is_exported());
        assert!(instance.manager.health().is_ready());

        let status = instance.manager.share_delete("vol-a").unwrap();
        assert_eq!(status.state, ShareState::Deleted);
        assert_eq!(status.export_id, 0);

        handle.await.unwrap().unwrap();

        assert!(instance.mounter.mounted_at(mount_path).is_none());
        assert!(!instance.daemon.is_running());
        assert!(!has_export_for(&instance.config_contents(), mount_path));
        assert_eq!(instance.manager.status().state, ShareState::Deleted);
    }

    #[tokio::test]
    async fn test_encrypted_volume_export_and_teardown() {
        let volume = VolumeDescriptor::new("vol-b", "ext4").with_passphrase("secret");
        let instance = Instance::new(volume, None);
        let mount_path = Path::new("/export/vol-b");

        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-b");

        let daemon = instance.daemon.clone();
        wait_until(move || daemon.is_running()).await;

        let (source, _) = instance.mounter.mounted_at(mount_path).unwrap();
        assert_eq!(source, Path::new("/dev/mapper/vol-b"));
        assert_eq!(instance.crypto.format_calls(), 1);
        assert_eq!(instance.crypto.open_calls(), 1);

        instance.manager.shutdown();
        handle.await.unwrap().unwrap();

        assert!(instance.mounter.mounted_at(mount_path).is_none());
        assert_eq!(instance.crypto.close_calls(), 1);
        assert!(!instance.daemon.is_running());
    }

    #[tokio::test]
    async fn test_restart_reuses_formatted_luks_device() {
        let volume = VolumeDescriptor::new("vol-b", "ext4").with_passphrase("secret");
        let first = Instance::new(volume.clone(), None);

        let handle = tokio::spawn(first.manager.clone().run());
        first.mounter.attach_device("/dev/longhorn/vol-b");
        let daemon = first.daemon.clone();
        wait_until(move || daemon.is_running()).await;
        first.manager.shutdown();
        handle.await.unwrap().unwrap();

        // A second lifecycle against the same host state must not reformat
        let config = ManagerConfig {
            wait_between_checks: Duration::from_millis(10),
            health_check_interval: Duration::from_millis(10),
            config_path: first.dir.path().join("vfs.conf"),
            ..Default::default()
        };
        let daemon = Arc::new(FakeNfsDaemon::new());
        let manager = ShareManager::new(
            volume,
            config,
            Dependencies {
                mounter: first.mounter.clone(),
                crypto: first.crypto.clone(),
                daemon: daemon.clone(),
                lease: None,
            },
        )
        .unwrap();
        assert_eq!(manager.status().export_id, 1);

        let handle = tokio::spawn(manager.clone().run());
        let running = daemon.clone();
        wait_until(move || running.is_running()).await;
        assert_eq!(first.crypto.format_calls(), 1);
        assert_eq!(first.crypto.open_calls(), 2);

        manager.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_daemon_failure_tears_down_volume() {
        let instance = Instance::new(VolumeDescriptor::new("vol-a", "ext4"), None);

        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-a");
        let daemon = instance.daemon.clone();
        wait_until(move || daemon.is_running()).await;

        instance.daemon.exit(Some("ganesha crashed"));
        let result = handle.await.unwrap();

        assert_matches!(result, Err(Error::NfsServer(reason)) if reason == "ganesha crashed");
        assert!(instance.mounter.mounted_at("/export/vol-a").is_none());
        assert_eq!(instance.manager.status().state, ShareState::Error);
        assert!(instance.manager.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_unreachable_mount_stops_instance() {
        let instance = Instance::new(VolumeDescriptor::new("vol-a", "ext4"), None);

        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-a");
        let daemon = instance.daemon.clone();
        wait_until(move || daemon.is_running()).await;

        instance.mounter.set_unreachable("/export/vol-a", true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!instance.manager.health().is_live());
        assert!(!instance.daemon.is_running());
    }
}

// =============================================================================
// Fast Failover
// =============================================================================

mod failover_tests {
    use super::*;

    fn failover_volume() -> VolumeDescriptor {
        let mut volume = VolumeDescriptor::new("vol-a", "ext4");
        volume.fast_failover = true;
        volume
    }

    #[tokio::test]
    async fn test_lease_hand_over_between_nodes() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut seed = LeaseRecord::new("vol-a", "node-old");
        seed.lease_transitions = 2;
        store.insert(seed);

        let lease_a = Arc::new(LeaseCoordinator::new(store.clone(), "vol-a", "node-a"));
        // Renewals stay out of the way of B's take
        let a = Instance::with_renew_interval(
            failover_volume(),
            Some(lease_a.clone()),
            Duration::from_secs(3600),
        );
        let handle_a = tokio::spawn(a.manager.clone().run());
        a.mounter.attach_device("/dev/longhorn/vol-a");
        let daemon = a.daemon.clone();
        wait_until(move || daemon.is_running()).await;

        let record = store.record("vol-a").unwrap();
        assert_eq!(record.holder_identity, "node-a");
        assert_eq!(record.lease_transitions, 3);

        // Node B takes over while A is still serving
        let lease_b = Arc::new(LeaseCoordinator::new(store.clone(), "vol-a", "node-b"));
        lease_b.take().await.unwrap();
        let record = store.record("vol-a").unwrap();
        assert_eq!(record.holder_identity, "node-b");
        assert_eq!(record.lease_transitions, 4);

        // A's renewal now conflicts and A never reclaims the lease
        assert_matches!(lease_a.renew().await, Err(Error::LeaseConflict { .. }));
        assert_eq!(store.record("vol-a").unwrap().holder_identity, "node-b");

        a.manager.shutdown();
        handle_a.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lease_renewal_keeps_acquire_time() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.insert(LeaseRecord::new("vol-a", "node-old"));

        let lease = Arc::new(LeaseCoordinator::new(store.clone(), "vol-a", "node-a"));
        let instance = Instance::new(failover_volume(), Some(lease));
        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-a");
        let daemon = instance.daemon.clone();
        wait_until(move || daemon.is_running()).await;

        let taken = store.record("vol-a").unwrap();
        let renew_store = store.clone();
        let taken_renew = taken.renew_time;
        wait_until(move || renew_store.record("vol-a").unwrap().renew_time > taken_renew).await;

        let renewed = store.record("vol-a").unwrap();
        assert_eq!(renewed.acquire_time, taken.acquire_time);
        assert_eq!(renewed.lease_transitions, taken.lease_transitions);
        assert_eq!(renewed.holder_identity, "node-a");

        instance.manager.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_lease_fails_before_export() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = Arc::new(LeaseCoordinator::new(store, "vol-a", "node-a"));
        let instance = Instance::new(failover_volume(), Some(lease));
        instance.mounter.attach_device("/dev/longhorn/vol-a");

        let result = instance.manager.clone().run().await;
        assert_matches!(result, Err(Error::Lease(_)));
        assert_eq!(instance.daemon.starts(), 0);
        assert_eq!(instance.manager.status().state, ShareState::Error);
    }
}

// =============================================================================
// Control API
// =============================================================================

mod api_tests {
    use super::*;
    use share_manager::api::{self, ShareClient};

    async fn start_api(manager: Arc<ShareManager>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = manager.cancellation();
        tokio::spawn(api::serve(listener, manager, shutdown));
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_client_drives_share_lifecycle() {
        let instance = Instance::new(VolumeDescriptor::new("vol-a", "ext4"), None);
        let endpoint = start_api(instance.manager.clone()).await;
        let client = ShareClient::new(&endpoint).unwrap();

        let status = client.get("vol-a").await.unwrap();
        assert_eq!(status.state, ShareState::Pending);
        assert_eq!(status.export_id, 1);

        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-a");
        let daemon = instance.daemon.clone();
        wait_until(move || daemon.is_running()).await;

        let status = client.create("vol-a").await.unwrap();
        assert_eq!(status.state, ShareState::Ready);
        assert_eq!(status.export_id, 1);

        let shares = client.list().await.unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].volume, "vol-a");

        assert_matches!(client.get("vol-z").await, Err(Error::Export { volume, .. }) if volume == "vol-z");

        let status = client.delete("vol-a").await.unwrap();
        assert_eq!(status.state, ShareState::Deleted);

        handle.await.unwrap().unwrap();
        assert!(instance.mounter.mounted_at("/export/vol-a").is_none());
    }

    #[tokio::test]
    async fn test_watch_streams_status_changes() {
        let instance = Instance::new(VolumeDescriptor::new("vol-a", "ext4"), None);
        let endpoint = start_api(instance.manager.clone()).await;
        let client = ShareClient::new(&endpoint).unwrap();

        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            client
                .watch(|status| {
                    seen.push(status.state);
                    status.state != ShareState::Ready
                })
                .await
                .unwrap();
            seen
        });

        // Let the watcher connect before the state changes
        tokio::time::sleep(Duration::from_millis(50)).await;
        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-a");

        let seen = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.first(), Some(&ShareState::Pending));
        assert_eq!(seen.last(), Some(&ShareState::Ready));

        instance.manager.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_probe_endpoints_follow_export() {
        let instance = Instance::new(VolumeDescriptor::new("vol-a", "ext4"), None);
        let endpoint = start_api(instance.manager.clone()).await;
        let http = reqwest::Client::new();

        let ready = http.get(format!("{}/readyz", endpoint)).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let live = http.get(format!("{}/livez", endpoint)).send().await.unwrap();
        assert_eq!(live.status(), reqwest::StatusCode::OK);

        let handle = tokio::spawn(instance.manager.clone().run());
        instance.mounter.attach_device("/dev/longhorn/vol-a");
        let manager = instance.manager.clone();
        wait_until(move || manager.is_exported()).await;

        let ready = http.get(format!("{}/readyz", endpoint)).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);

        let metrics = http
            .get(format!("{}/metrics", endpoint))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("share_manager_export_active"));

        instance.manager.shutdown();
        handle.await.unwrap().unwrap();
    }
}
