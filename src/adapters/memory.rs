//! In-Memory Adapters
//!
//! Deterministic implementations of every domain port. They keep all state in
//! memory, record calls for later inspection and never touch the host, which
//! makes the orchestrator testable end to end without devices or a cluster.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    CryptoDevice, CryptoParams, DiskFormat, EncryptionStatus, LeaseRecord, LeaseStore, Mounter,
    NfsDaemon, LUKS_FORMAT,
};
use crate::error::{Error, Result};
use crate::volume::DEFAULT_MAPPER_ROOT;

// =============================================================================
// Mounter
// =============================================================================

#[derive(Debug, Default)]
struct MountState {
    block_devices: HashSet<PathBuf>,
    formats: HashMap<PathBuf, String>,
    mounts: HashMap<PathBuf, (PathBuf, String)>,
    permissions: HashMap<PathBuf, u32>,
    read_only: HashSet<PathBuf>,
    unreachable: HashSet<PathBuf>,
    fail_remount: bool,
    remount_delay: Option<Duration>,
    format_calls: usize,
    resize_calls: usize,
    remount_calls: usize,
    unmount_calls: usize,
}

/// In-memory mount/format utility.
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<MountState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a block device appear.
    pub fn attach_device(&self, device: impl AsRef<Path>) {
        self.state
            .lock()
            .block_devices
            .insert(device.as_ref().to_path_buf());
    }

    /// Make a block device disappear.
    pub fn detach_device(&self, device: impl AsRef<Path>) {
        self.state.lock().block_devices.remove(device.as_ref());
    }

    /// Set the on-disk format of a device.
    pub fn set_format(&self, device: impl AsRef<Path>, format: &str) {
        self.state
            .lock()
            .formats
            .insert(device.as_ref().to_path_buf(), format.to_string());
    }

    /// Flip a mount between read-only and read-write.
    pub fn set_read_only(&self, path: impl AsRef<Path>, read_only: bool) {
        let mut state = self.state.lock();
        if read_only {
            state.read_only.insert(path.as_ref().to_path_buf());
        } else {
            state.read_only.remove(path.as_ref());
        }
    }

    /// Make the liveness probe of a path fail.
    pub fn set_unreachable(&self, path: impl AsRef<Path>, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(path.as_ref().to_path_buf());
        } else {
            state.unreachable.remove(path.as_ref());
        }
    }

    /// Make remount attempts fail.
    pub fn fail_remount(&self, fail: bool) {
        self.state.lock().fail_remount = fail;
    }

    /// Make remount attempts hang for `delay` before completing.
    pub fn delay_remount(&self, delay: Duration) {
        self.state.lock().remount_delay = Some(delay);
    }

    /// Device and filesystem type mounted at `path`.
    pub fn mounted_at(&self, path: impl AsRef<Path>) -> Option<(PathBuf, String)> {
        self.state.lock().mounts.get(path.as_ref()).cloned()
    }

    pub fn permissions(&self, path: impl AsRef<Path>) -> Option<u32> {
        self.state.lock().permissions.get(path.as_ref()).copied()
    }

    pub fn format_calls(&self) -> usize {
        self.state.lock().format_calls
    }

    pub fn resize_calls(&self) -> usize {
        self.state.lock().resize_calls
    }

    pub fn remount_calls(&self) -> usize {
        self.state.lock().remount_calls
    }

    pub fn unmount_calls(&self) -> usize {
        self.state.lock().unmount_calls
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn disk_format(&self, device: &Path) -> Result<DiskFormat> {
        let state = self.state.lock();
        if !state.block_devices.contains(device) {
            return Err(Error::Mount {
                path: device.display().to_string(),
                reason: "no such device".to_string(),
            });
        }
        Ok(DiskFormat::new(
            state.formats.get(device).cloned().unwrap_or_default(),
        ))
    }

    async fn is_block_device(&self, path: &Path) -> bool {
        self.state.lock().block_devices.contains(path)
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().mounts.contains_key(path))
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        path: &Path,
        fs_type: &str,
        _mount_options: &[String],
        _format_options: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.block_devices.contains(device) {
            return Err(Error::Mount {
                path: path.display().to_string(),
                reason: format!("invalid device {}", device.display()),
            });
        }
        let existing = state.formats.get(device).cloned().unwrap_or_default();
        if existing.is_empty() {
            state.format_calls += 1;
            state
                .formats
                .insert(device.to_path_buf(), fs_type.to_string());
        }
        state.mounts.insert(
            path.to_path_buf(),
            (device.to_path_buf(), fs_type.to_string()),
        );
        Ok(())
    }

    async fn resize(&self, _device: &Path, _path: &Path) -> Result<bool> {
        self.state.lock().resize_calls += 1;
        Ok(false)
    }

    async fn unmount(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.unmount_calls += 1;
        state.mounts.remove(path);
        state.read_only.remove(path);
        Ok(())
    }

    async fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        self.state.lock().permissions.insert(path.to_path_buf(), mode);
        Ok(())
    }

    async fn probe(&self, path: &Path) -> Result<()> {
        let state = self.state.lock();
        if state.unreachable.contains(path) || !state.mounts.contains_key(path) {
            return Err(Error::Mount {
                path: path.display().to_string(),
                reason: "mount point is not reachable".to_string(),
            });
        }
        Ok(())
    }

    async fn is_read_only(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().read_only.contains(path))
    }

    async fn remount_read_write(&self, path: &Path) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.remount_calls += 1;
            state.remount_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_remount {
            return Err(Error::command("mount", "remount failed"));
        }
        state.read_only.remove(path);
        Ok(())
    }
}

// =============================================================================
// Crypto Device
// =============================================================================

#[derive(Debug, Default)]
struct CryptoState {
    passphrases: HashMap<PathBuf, String>,
    mappings: HashMap<String, PathBuf>,
    format_calls: usize,
    open_calls: usize,
    close_calls: usize,
    resize_calls: usize,
}

/// In-memory LUKS utility.
///
/// Formatting marks the device `crypto_LUKS` on the paired [`FakeMounter`] and
/// opening a mapping makes the mapped device appear there as a block device.
#[derive(Debug)]
pub struct FakeCryptoDevice {
    mounter: Arc<FakeMounter>,
    mapper_root: PathBuf,
    state: Mutex<CryptoState>,
}

impl FakeCryptoDevice {
    pub fn new(mounter: Arc<FakeMounter>) -> Self {
        Self {
            mounter,
            mapper_root: PathBuf::from(DEFAULT_MAPPER_ROOT),
            state: Mutex::new(CryptoState::default()),
        }
    }

    pub fn format_calls(&self) -> usize {
        self.state.lock().format_calls
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn resize_calls(&self) -> usize {
        self.state.lock().resize_calls
    }
}

#[async_trait]
impl CryptoDevice for FakeCryptoDevice {
    async fn format(&self, device: &Path, passphrase: &str, _params: &CryptoParams) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.format_calls += 1;
            state
                .passphrases
                .insert(device.to_path_buf(), passphrase.to_string());
        }
        self.mounter.set_format(device, LUKS_FORMAT);
        Ok(())
    }

    async fn open(&self, mapping_name: &str, device: &Path, passphrase: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.open_calls += 1;
            match state.passphrases.get(device) {
                Some(expected) if expected == passphrase => {}
                _ => {
                    return Err(Error::Crypto {
                        device: device.display().to_string(),
                        reason: "no key available with this passphrase".to_string(),
                    })
                }
            }
            state
                .mappings
                .insert(mapping_name.to_string(), device.to_path_buf());
        }
        self.mounter.attach_device(self.mapper_root.join(mapping_name));
        Ok(())
    }

    async fn close(&self, mapping_name: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.close_calls += 1;
            state.mappings.remove(mapping_name);
        }
        self.mounter.detach_device(self.mapper_root.join(mapping_name));
        Ok(())
    }

    async fn resize(&self, mapping_name: &str, _passphrase: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.mappings.contains_key(mapping_name) {
            return Err(Error::Crypto {
                device: mapping_name.to_string(),
                reason: "mapping is not active".to_string(),
            });
        }
        state.resize_calls += 1;
        Ok(())
    }

    async fn status(&self, device: &Path) -> Result<EncryptionStatus> {
        let state = self.state.lock();
        let name = match device.strip_prefix(&self.mapper_root) {
            Ok(name) => name.display().to_string(),
            Err(_) => return Ok(EncryptionStatus::unmapped(device.display().to_string())),
        };
        Ok(match state.mappings.get(&name) {
            Some(backing) => EncryptionStatus {
                mapped_device: backing.display().to_string(),
                mapper_name: name,
            },
            None => EncryptionStatus::unmapped(device.display().to_string()),
        })
    }
}

// =============================================================================
// Lease Store
// =============================================================================

/// In-memory lease store with resource-version based conflict detection.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
    version: AtomicUsize,
    fail_updates: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record, assigning it a fresh version.
    pub fn insert(&self, mut record: LeaseRecord) {
        record.resource_version = Some(self.next_version());
        self.leases.lock().insert(record.name.clone(), record);
    }

    /// Current stored record.
    pub fn record(&self, name: &str) -> Option<LeaseRecord> {
        self.leases.lock().get(name).cloned()
    }

    /// Make every update fail as if the API were unreachable.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<LeaseRecord> {
        self.record(name)
            .ok_or_else(|| Error::Lease(format!("lease {} not found", name)))
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Lease("lease API unreachable".to_string()));
        }

        let mut leases = self.leases.lock();
        let current = leases
            .get(&record.name)
            .ok_or_else(|| Error::Lease(format!("lease {} not found", record.name)))?;
        if current.resource_version != record.resource_version {
            return Err(Error::LeaseConflict {
                name: record.name.clone(),
            });
        }

        let mut stored = record.clone();
        stored.resource_version = Some(self.next_version());
        leases.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }
}

// =============================================================================
// NFS Daemon
// =============================================================================

/// NFS daemon stand-in that runs until cancelled or told to exit.
#[derive(Debug, Default)]
pub struct FakeNfsDaemon {
    running: AtomicBool,
    starts: AtomicUsize,
    exit: Notify,
    exit_error: Mutex<Option<String>>,
}

impl FakeNfsDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Make the running daemon exit, optionally with an error.
    pub fn exit(&self, error: Option<&str>) {
        *self.exit_error.lock() = error.map(str::to_string);
        self.exit.notify_one();
    }
}

#[async_trait]
impl NfsDaemon for FakeNfsDaemon {
    async fn run(&self, _config_path: &Path, cancel: CancellationToken) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.exit.notified() => match self.exit_error.lock().take() {
                Some(reason) => Err(Error::NfsServer(reason)),
                None => Ok(()),
            },
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_lease_store_rejects_stale_writes() {
        let store = InMemoryLeaseStore::new();
        store.insert(LeaseRecord::new("vol-a", "node-1"));

        let first = store.get("vol-a").await.unwrap();
        let stale = first.clone();

        let mut updated = first;
        updated.holder_identity = "node-2".to_string();
        store.update(&updated).await.unwrap();

        let result = store.update(&stale).await;
        assert_matches!(result, Err(Error::LeaseConflict { .. }));
        assert_eq!(store.record("vol-a").unwrap().holder_identity, "node-2");
    }

    #[tokio::test]
    async fn test_fake_daemon_stops_on_cancel() {
        let daemon = Arc::new(FakeNfsDaemon::new());
        let cancel = CancellationToken::new();

        let handle = {
            let daemon = daemon.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { daemon.run(Path::new("/tmp/vfs.conf"), cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!daemon.is_running());
        assert_eq!(daemon.starts(), 1);
    }
}
