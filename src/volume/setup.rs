//! Device Setup Pipeline
//!
//! Resolves the device to mount (raw or LUKS mapped), mounts it with the
//! right filesystem type and grows the filesystem to the device size.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use super::{VolumeDescriptor, VolumePaths};
use crate::crypto::CryptoVolumes;
use crate::domain::Mounter;
use crate::error::{Error, Result};

/// Device preparation and mount steps for one volume.
#[derive(Clone)]
pub struct DeviceSetup {
    mounter: Arc<dyn Mounter>,
    crypto: CryptoVolumes,
    paths: VolumePaths,
}

impl DeviceSetup {
    pub fn new(mounter: Arc<dyn Mounter>, crypto: CryptoVolumes, paths: VolumePaths) -> Self {
        Self {
            mounter,
            crypto,
            paths,
        }
    }

    /// Return the path the volume should be mounted from.
    ///
    /// Encrypted volumes are LUKS formatted on first use, then opened, and the
    /// mapped device path is returned. Plain volumes return `device_path`.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn setup_device(&self, vol: &VolumeDescriptor, device_path: &Path) -> Result<PathBuf> {
        let disk_format = self.mounter.disk_format(device_path).await.map_err(|e| {
            Error::Mount {
                path: device_path.display().to_string(),
                reason: format!("failed to determine filesystem format: {}", e),
            }
        })?;
        info!(
            device = %device_path.display(),
            "Volume device contains filesystem of format {}", disk_format
        );

        if !(vol.is_encrypted() || disk_format.is_luks()) {
            return Ok(device_path.to_path_buf());
        }

        if vol.passphrase.is_empty() {
            return Err(Error::MissingPassphrase {
                volume: vol.name.clone(),
            });
        }

        if disk_format.is_unformatted() {
            info!("Encrypting new volume before first use");
            self.crypto
                .encrypt_volume(device_path, &vol.passphrase, &vol.crypto)
                .await?;
        }

        let crypto_device = self.paths.mapped_device_path(&vol.name, vol.data_engine);
        info!(crypto_device = %crypto_device.display(), "Volume requires crypto device");
        if let Err(e) = self
            .crypto
            .open_volume(&vol.name, vol.data_engine, device_path, &vol.passphrase)
            .await
        {
            error!("Failed to open encrypted volume: {}", e);
            return Err(e);
        }

        Ok(crypto_device)
    }

    /// Close the volume's crypto mapping if one is open.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn tear_down_device(&self, vol: &VolumeDescriptor) -> Result<()> {
        self.crypto.close_if_open(&vol.name, vol.data_engine).await?;
        Ok(())
    }

    /// Mount `device_path` at `mount_path`.
    ///
    /// A disk that already carries a filesystem is mounted with that type even
    /// if a different one was requested; it is never reformatted.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn mount_volume(
        &self,
        vol: &VolumeDescriptor,
        device_path: &Path,
        mount_path: &Path,
    ) -> Result<()> {
        if !self.mounter.is_block_device(device_path).await {
            return Err(Error::Mount {
                path: mount_path.display().to_string(),
                reason: format!("invalid device {}", device_path.display()),
            });
        }

        if self.mounter.is_mount_point(mount_path).await.unwrap_or(false) {
            return Ok(());
        }

        let disk_format = self.mounter.disk_format(device_path).await.map_err(|e| {
            error!("Failed to evaluate disk format: {}", e);
            e
        })?;

        let mut fs_type = vol.fs_type.as_str();
        if disk_format.is_filesystem() && disk_format.as_str() != fs_type {
            warn!(
                "Disk is already formatted to {} but user requested fs is {}, using existing device fs type for mount",
                disk_format, fs_type
            );
            fs_type = disk_format.as_str();
        }

        self.mounter
            .format_and_mount(
                device_path,
                mount_path,
                fs_type,
                &vol.mount_options,
                &vol.format_options,
            )
            .await
    }

    /// Grow the filesystem (and, for encrypted volumes, the mapping first) to
    /// the current device size. Already sized filesystems are not an error.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn resize_volume(
        &self,
        vol: &VolumeDescriptor,
        device_path: &Path,
        mount_path: &Path,
    ) -> Result<()> {
        if self.paths.is_mapper_path(device_path) {
            self.crypto
                .resize_volume(&vol.name, vol.data_engine, &vol.passphrase)
                .await?;
        }

        match self.mounter.resize(device_path, mount_path).await {
            Ok(true) => {
                info!("Resized filesystem for volume after mount");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!("Failed to resize filesystem for volume: {}", e);
                Err(e)
            }
        }
    }

    /// Set the mount point permissions. The path must be a live mount.
    pub async fn set_permissions(&self, mount_path: &Path, mode: u32) -> Result<()> {
        if !self.mounter.is_mount_point(mount_path).await? {
            return Err(Error::Mount {
                path: mount_path.display().to_string(),
                reason: format!("cannot set permissions {:o}, invalid mount point", mode),
            });
        }
        self.mounter.set_permissions(mount_path, mode).await
    }

    /// Unmount and clean up the mount point.
    pub async fn unmount_volume(&self, mount_path: &Path) -> Result<()> {
        self.mounter.unmount(mount_path).await
    }
}

impl std::fmt::Debug for DeviceSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSetup")
            .field("paths", &self.paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeCryptoDevice, FakeMounter};
    use crate::domain::LUKS_FORMAT;
    use assert_matches::assert_matches;

    struct Fixture {
        setup: DeviceSetup,
        mounter: Arc<FakeMounter>,
        crypto: Arc<FakeCryptoDevice>,
    }

    fn fixture() -> Fixture {
        let mounter = Arc::new(FakeMounter::new());
        let crypto = Arc::new(FakeCryptoDevice::new(mounter.clone()));
        let paths = VolumePaths::default();
        let setup = DeviceSetup::new(
            mounter.clone(),
            CryptoVolumes::new(crypto.clone(), paths.clone()),
            paths,
        );
        Fixture {
            setup,
            mounter,
            crypto,
        }
    }

    #[tokio::test]
    async fn test_plain_volume_uses_raw_device() {
        let f = fixture();
        let raw = PathBuf::from("/dev/longhorn/vol-a");
        f.mounter.attach_device(&raw);

        let vol = VolumeDescriptor::new("vol-a", "ext4");
        let device = f.setup.setup_device(&vol, &raw).await.unwrap();
        assert_eq!(device, raw);
        assert_eq!(f.crypto.format_calls(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_volume_formats_once() {
        let f = fixture();
        let raw = PathBuf::from("/dev/longhorn/vol-b");
        f.mounter.attach_device(&raw);

        let vol = VolumeDescriptor::new("vol-b", "ext4").with_passphrase("secret");
        let device = f.setup.setup_device(&vol, &raw).await.unwrap();
        assert_eq!(device, PathBuf::from("/dev/mapper/vol-b"));
        assert_eq!(f.crypto.format_calls(), 1);
        assert_eq!(f.crypto.open_calls(), 1);

        f.setup.tear_down_device(&vol).await.unwrap();
        let device = f.setup.setup_device(&vol, &raw).await.unwrap();
        assert_eq!(device, PathBuf::from("/dev/mapper/vol-b"));
        assert_eq!(f.crypto.format_calls(), 1);
        assert_eq!(f.crypto.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_luks_device_without_passphrase_fails() {
        let f = fixture();
        let raw = PathBuf::from("/dev/longhorn/vol-b");
        f.mounter.attach_device(&raw);
        f.mounter.set_format(&raw, LUKS_FORMAT);

        let vol = VolumeDescriptor::new("vol-b", "ext4");
        let result = f.setup.setup_device(&vol, &raw).await;
        assert_matches!(result, Err(Error::MissingPassphrase { .. }));
    }

    #[tokio::test]
    async fn test_mount_prefers_existing_filesystem() {
        let f = fixture();
        let raw = PathBuf::from("/dev/longhorn/vol-a");
        f.mounter.attach_device(&raw);
        f.mounter.set_format(&raw, "xfs");

        let vol = VolumeDescriptor::new("vol-a", "ext4");
        let mount_path = PathBuf::from("/export/vol-a");
        f.setup.mount_volume(&vol, &raw, &mount_path).await.unwrap();

        let (device, fs_type) = f.mounter.mounted_at(&mount_path).unwrap();
        assert_eq!(device, raw);
        assert_eq!(fs_type, "xfs");
        assert_eq!(f.mounter.format_calls(), 0);
    }

    #[tokio::test]
    async fn test_mount_ignores_partition_table_signature() {
        let f = fixture();
        let raw = PathBuf::from("/dev/longhorn/vol-a");
        f.mounter.attach_device(&raw);
        f.mounter.set_format(&raw, "unknown data, probably partitions");

        let vol = VolumeDescriptor::new("vol-a", "ext4");
        let mount_path = PathBuf::from("/export/vol-a");
        f.setup.mount_volume(&vol, &raw, &mount_path).await.unwrap();

        let (_, fs_type) = f.mounter.mounted_at(&mount_path).unwrap();
        assert_eq!(fs_type, "ext4");
    }

    #[tokio::test]
    async fn test_mount_rejects_missing_device() {
        let f = fixture();
        let vol = VolumeDescriptor::new("vol-a", "ext4");
        let result = f
            .setup
            .mount_volume(
                &vol,
                Path::new("/dev/longhorn/vol-a"),
                Path::new("/export/vol-a"),
            )
            .await;
        assert_matches!(result, Err(Error::Mount { .. }));
    }

    #[tokio::test]
    async fn test_set_permissions_requires_mount() {
        let f = fixture();
        let mount_path = PathBuf::from("/export/vol-a");
        assert!(f.setup.set_permissions(&mount_path, 0o777).await.is_err());

        let raw = PathBuf::from("/dev/longhorn/vol-a");
        f.mounter.attach_device(&raw);
        let vol = VolumeDescriptor::new("vol-a", "ext4");
        f.setup.mount_volume(&vol, &raw, &mount_path).await.unwrap();
        f.setup.set_permissions(&mount_path, 0o777).await.unwrap();
        assert_eq!(f.mounter.permissions(&mount_path), Some(0o777));
    }
}
