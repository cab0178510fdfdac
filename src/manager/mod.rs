//! Volume Export Orchestrator
//!
//! Drives one volume through device setup, mount, export and supervision,
//! and guarantees teardown on every exit path.
//!
//! # Lifecycle
//!
//! ```text
//!   wait for device ──▶ setup device ──▶ mount ──▶ resize ──▶ chmod 0777
//!                                                                │
//!   ┌────────────────────────────────────────────────────────────┘
//!   ▼
//!   take lease (fast failover) ──▶ spawn health monitor + lease renewal
//!                                                                │
//!   ┌────────────────────────────────────────────────────────────┘
//!   ▼
//!   create export ──▶ run NFS daemon (blocks) ──▶ cleanup
//!                                                 unmount, close crypto, cancel
//! ```
//!
//! A single [`CancellationToken`] is shared by the run loop, the daemon and
//! every background task. Cancelling it (signal, API delete, unhealthy
//! mount) unwinds the whole instance.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::crypto::CryptoVolumes;
use crate::domain::{CryptoDevice, Mounter, NfsDaemon};
use crate::error::{Error, Result};
use crate::health::{HealthCheck, HealthMonitor, DEFAULT_HEALTH_CHECK_INTERVAL};
use crate::lease::{LeaseCoordinator, DEFAULT_RENEW_INTERVAL};
use crate::metrics;
use crate::nfs::{NfsServer, DEFAULT_CONFIG_PATH};
use crate::volume::{DeviceSetup, VolumeDescriptor, VolumePaths};

/// Permissions applied to the mount point so the export is writable by all
const MOUNT_PERMISSIONS: u32 = 0o777;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the share manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Poll period while waiting for the device to attach
    pub wait_between_checks: Duration,

    /// Failover lease renewal period
    pub lease_renew_interval: Duration,

    /// Mount health check period
    pub health_check_interval: Duration,

    /// Device and mount path layout
    pub paths: VolumePaths,

    /// Ganesha configuration file
    pub config_path: PathBuf,

    /// Buffered status updates per watcher
    pub status_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            wait_between_checks: Duration::from_secs(5),
            lease_renew_interval: DEFAULT_RENEW_INTERVAL,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            paths: VolumePaths::default(),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            status_channel_capacity: 64,
        }
    }
}

/// External collaborators of the manager.
#[derive(Clone)]
pub struct Dependencies {
    pub mounter: Arc<dyn Mounter>,
    pub crypto: Arc<dyn CryptoDevice>,
    pub daemon: Arc<dyn NfsDaemon>,
    /// Failover lease client; `None` when no lease client could be built
    pub lease: Option<Arc<LeaseCoordinator>>,
}

// =============================================================================
// Share Status
// =============================================================================

/// Export state reported through the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareState {
    Pending,
    Ready,
    Error,
    Deleted,
}

impl std::fmt::Display for ShareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareState::Pending => write!(f, "Pending"),
            ShareState::Ready => write!(f, "Ready"),
            ShareState::Error => write!(f, "Error"),
            ShareState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Status record of one share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareStatus {
    pub volume: String,
    pub export_id: u16,
    pub state: ShareState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Share Manager
// =============================================================================

/// Orchestrates the export of one volume.
pub struct ShareManager {
    volume: VolumeDescriptor,
    config: ManagerConfig,
    mounter: Arc<dyn Mounter>,
    setup: DeviceSetup,
    nfs: NfsServer,
    lease: Option<Arc<LeaseCoordinator>>,
    cancel: CancellationToken,
    exported: AtomicBool,
    health: Arc<HealthCheck>,
    status: RwLock<ShareStatus>,
    events: broadcast::Sender<ShareStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShareManager {
    /// Validate the volume and prepare the NFS server and its export entry.
    pub fn new(
        volume: VolumeDescriptor,
        config: ManagerConfig,
        deps: Dependencies,
    ) -> Result<Arc<Self>> {
        volume.validate()?;

        let crypto = CryptoVolumes::new(deps.crypto, config.paths.clone());
        let setup = DeviceSetup::new(deps.mounter.clone(), crypto, config.paths.clone());
        let nfs = NfsServer::new(
            &config.config_path,
            &config.paths.export_root,
            &volume,
            deps.daemon,
        )?;

        let (events, _) = broadcast::channel(config.status_channel_capacity.max(1));
        let status = ShareStatus {
            volume: volume.name.clone(),
            export_id: nfs.get_export(&volume.name),
            state: ShareState::Pending,
            error: None,
        };

        Ok(Arc::new(Self {
            volume,
            config,
            mounter: deps.mounter,
            setup,
            nfs,
            lease: deps.lease,
            cancel: CancellationToken::new(),
            exported: AtomicBool::new(false),
            health: Arc::new(HealthCheck::new()),
            status: RwLock::new(status),
            events,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn volume(&self) -> &VolumeDescriptor {
        &self.volume
    }

    pub fn health(&self) -> Arc<HealthCheck> {
        self.health.clone()
    }

    /// Token cancelled when the instance shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn mount_path(&self) -> PathBuf {
        self.config.paths.mount_path(&self.volume.name)
    }

    pub fn is_exported(&self) -> bool {
        self.exported.load(Ordering::SeqCst)
    }

    fn set_exported(&self, exported: bool) {
        self.exported.store(exported, Ordering::SeqCst);
        self.health.set_ready(exported);
        metrics::EXPORT_ACTIVE.set(i64::from(exported));
    }

    /// Cancel the lifecycle. Idempotent.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(volume = %self.volume.name, "Shutting down share manager");
        }
        self.cancel.cancel();
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    /// Run until shutdown, then unmount and close the crypto device.
    ///
    /// Cleanup also runs when the loop fails or panics.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let span = info_span!(
            "share",
            volume = %self.volume.name,
            encrypted = self.volume.is_encrypted()
        );

        let inner = self.clone();
        let result = match tokio::spawn(inner.run_loop().instrument(span.clone())).await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("share manager task failed: {}", e))),
        };

        self.cleanup().instrument(span.clone()).await;

        let _enter = span.enter();
        match &result {
            Ok(()) => info!("Share manager stopped"),
            Err(e) => {
                error!("Share manager failed: {}", e);
                if self.status().state != ShareState::Deleted {
                    self.publish(ShareState::Error, Some(e.to_string()));
                }
            }
        }
        result
    }

    async fn run_loop(self: Arc<Self>) -> Result<()> {
        let device_path = self.config.paths.device_path(&self.volume.name);
        let mount_path = self.mount_path();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if self.mounter.is_block_device(&device_path).await {
                return self.serve(&device_path, &mount_path).await;
            }

            warn!(
                device = %device_path.display(),
                "Volume device is not attached yet, waiting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.wait_between_checks) => {}
            }
        }
    }

    async fn serve(&self, device_path: &Path, mount_path: &Path) -> Result<()> {
        let vol = &self.volume;

        let device = self.setup.setup_device(vol, device_path).await?;
        self.setup.mount_volume(vol, &device, mount_path).await?;
        self.setup.resize_volume(vol, &device, mount_path).await?;
        self.setup
            .set_permissions(mount_path, MOUNT_PERMISSIONS)
            .await?;

        if vol.fast_failover {
            let lease = self.lease.clone().ok_or(Error::LeaseClientUnset)?;
            lease.take().await.map_err(|e| {
                error!("Failed to take over failover lease: {}", e);
                e
            })?;
            self.spawn(lease.run_renewal(self.config.lease_renew_interval, self.cancel.clone()));
        }

        let monitor = HealthMonitor::new(
            mount_path,
            self.mounter.clone(),
            self.config.health_check_interval,
            self.health.clone(),
        );
        self.spawn(monitor.run(self.cancel.clone()));

        let export_id = self.nfs.create_export(&vol.name)?;
        self.set_exported(true);
        self.publish_export(ShareState::Ready, export_id, None);
        info!(export_id, mount_path = %mount_path.display(), "Volume exported, starting NFS server");

        let result = self.nfs.run(self.cancel.clone()).await;
        self.set_exported(false);
        result
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task.in_current_span());
        self.tasks.lock().push(handle);
    }

    async fn cleanup(&self) {
        info!("Cleaning up volume");
        self.set_exported(false);

        let mount_path = self.mount_path();
        if let Err(e) = self.setup.unmount_volume(&mount_path).await {
            error!(mount_path = %mount_path.display(), "Failed to unmount volume: {}", e);
        }
        if let Err(e) = self.setup.tear_down_device(&self.volume).await {
            error!("Failed to tear down volume: {}", e);
        }

        self.shutdown();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }
    }

    // =========================================================================
    // Share Operations
    // =========================================================================

    fn ensure_served(&self, volume: &str) -> Result<()> {
        if self.serves(volume) {
            return Ok(());
        }
        Err(Error::Export {
            volume: volume.to_string(),
            reason: format!("this instance serves volume {}", self.volume.name),
        })
    }

    /// Whether `volume` is the volume of this instance.
    pub fn serves(&self, volume: &str) -> bool {
        volume == self.volume.name
    }

    /// Ensure the export entry exists.
    ///
    /// Returns `Ready` once the daemon is serving it, `Pending` before.
    pub fn share_create(&self, volume: &str) -> Result<ShareStatus> {
        self.ensure_served(volume)?;
        let export_id = self.nfs.create_export(volume)?;
        let state = if self.is_exported() {
            ShareState::Ready
        } else {
            ShareState::Pending
        };
        Ok(self.publish_export(state, export_id, None))
    }

    /// Remove the export entry and shut the instance down.
    pub fn share_delete(&self, volume: &str) -> Result<ShareStatus> {
        self.ensure_served(volume)?;
        let export_id = self.nfs.delete_export(volume)?;
        debug!(export_id, "Removed export entry");
        self.set_exported(false);
        let status = self.publish_export(ShareState::Deleted, 0, None);
        self.shutdown();
        Ok(status)
    }

    pub fn share_get(&self, volume: &str) -> Result<ShareStatus> {
        self.ensure_served(volume)?;
        Ok(self.status())
    }

    pub fn share_list(&self) -> Vec<ShareStatus> {
        vec![self.status()]
    }

    /// Current status of the served volume.
    pub fn status(&self) -> ShareStatus {
        self.status.read().clone()
    }

    /// Receive every status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ShareStatus> {
        self.events.subscribe()
    }

    fn publish(&self, state: ShareState, error: Option<String>) -> ShareStatus {
        let export_id = self.nfs.get_export(&self.volume.name);
        self.publish_export(state, export_id, error)
    }

    fn publish_export(&self, state: ShareState, export_id: u16, error: Option<String>) -> ShareStatus {
        let status = ShareStatus {
            volume: self.volume.name.clone(),
            export_id,
            state,
            error,
        };
        *self.status.write() = status.clone();
        // No receivers is fine.
        let _ = self.events.send(status.clone());
        status
    }
}

impl std::fmt::Debug for ShareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareManager")
            .field("volume", &self.volume)
            .field("config", &self.config)
            .field("exported", &self.is_exported())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
