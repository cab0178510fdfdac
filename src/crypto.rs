//! Encrypted Device Lifecycle
//!
//! Format, open, resize and close of a volume's LUKS mapping on top of the
//! [`CryptoDevice`] port. The mapped device for a volume exists exactly while
//! the volume is open for encrypted access.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::domain::{CryptoDevice, CryptoParams, EncryptionStatus};
use crate::error::{Error, Result};
use crate::volume::{DataEngine, VolumePaths};

/// LUKS lifecycle for volumes laid out under [`VolumePaths`].
#[derive(Clone)]
pub struct CryptoVolumes {
    device: Arc<dyn CryptoDevice>,
    paths: VolumePaths,
}

impl CryptoVolumes {
    pub fn new(device: Arc<dyn CryptoDevice>, paths: VolumePaths) -> Self {
        Self { device, paths }
    }

    /// Format the raw device as a LUKS container.
    #[instrument(skip(self, passphrase, params), fields(device = %device_path.display()))]
    pub async fn encrypt_volume(
        &self,
        device_path: &Path,
        passphrase: &str,
        params: &CryptoParams,
    ) -> Result<()> {
        debug!("Encrypting device with LUKS");
        self.device
            .format(device_path, passphrase, params)
            .await
            .map_err(|e| Error::Crypto {
                device: device_path.display().to_string(),
                reason: format!("failed to encrypt device with LUKS: {}", e),
            })
    }

    /// Open the volume's mapping. Opening an already open mapping is a no-op.
    #[instrument(skip(self, passphrase), fields(device = %device_path.display()))]
    pub async fn open_volume(
        &self,
        volume: &str,
        engine: DataEngine,
        device_path: &Path,
        passphrase: &str,
    ) -> Result<()> {
        let mapped = self.paths.mapped_device_path(volume, engine);
        if self.is_device_open(&mapped).await.unwrap_or(false) {
            debug!(mapped = %mapped.display(), "Device is already opened");
            return Ok(());
        }

        let mapping_name = self.paths.mapping_name(volume, engine);
        debug!(mapping = %mapping_name, "Opening device with LUKS");
        if let Err(e) = self
            .device
            .open(&mapping_name, device_path, passphrase)
            .await
        {
            warn!(mapping = %mapping_name, "Failed to open LUKS device: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Close the volume's mapping.
    #[instrument(skip(self))]
    pub async fn close_volume(&self, volume: &str, engine: DataEngine) -> Result<()> {
        let mapping_name = self.paths.mapping_name(volume, engine);
        debug!(mapping = %mapping_name, "Closing LUKS device");
        self.device.close(&mapping_name).await
    }

    /// Grow an open mapping to the size of its backing device.
    #[instrument(skip(self, passphrase))]
    pub async fn resize_volume(
        &self,
        volume: &str,
        engine: DataEngine,
        passphrase: &str,
    ) -> Result<()> {
        let mapped = self.paths.mapped_device_path(volume, engine);
        if !self.is_device_open(&mapped).await? {
            return Err(Error::Crypto {
                device: mapped.display().to_string(),
                reason: format!("crypto device of volume {} is closed for resizing", volume),
            });
        }

        self.device
            .resize(&self.paths.mapping_name(volume, engine), passphrase)
            .await
    }

    /// Whether `device` is an active mapping.
    pub async fn is_device_open(&self, device: &Path) -> Result<bool> {
        Ok(self.device_encryption_status(device).await?.is_open())
    }

    /// Mapping status of `device`. Paths outside the mapper root are never
    /// mappings and are answered without consulting the crypto utility.
    pub async fn device_encryption_status(&self, device: &Path) -> Result<EncryptionStatus> {
        if !self.paths.is_mapper_path(device) {
            return Ok(EncryptionStatus::unmapped(device.display().to_string()));
        }
        self.device.status(device).await
    }

    /// Tear down the volume's mapping if it is open.
    pub async fn close_if_open(&self, volume: &str, engine: DataEngine) -> Result<bool> {
        let mapped = self.paths.mapped_device_path(volume, engine);
        if !self.is_device_open(&mapped).await? {
            return Ok(false);
        }

        info!(mapped = %mapped.display(), "Volume has active crypto device");
        self.close_volume(volume, engine).await?;
        info!(mapped = %mapped.display(), "Volume closed active crypto device");
        Ok(true)
    }
}

impl std::fmt::Debug for CryptoVolumes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoVolumes")
            .field("paths", &self.paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeCryptoDevice, FakeMounter};
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn volumes() -> (CryptoVolumes, Arc<FakeCryptoDevice>) {
        let mounter = Arc::new(FakeMounter::new());
        let device = Arc::new(FakeCryptoDevice::new(mounter));
        (
            CryptoVolumes::new(device.clone(), VolumePaths::default()),
            device,
        )
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (crypto, device) = volumes();
        let raw = PathBuf::from("/dev/longhorn/vol-b");

        crypto.encrypt_volume(&raw, "secret", &CryptoParams::default()).await.unwrap();
        crypto.open_volume("vol-b", DataEngine::V1, &raw, "secret").await.unwrap();
        crypto.open_volume("vol-b", DataEngine::V1, &raw, "secret").await.unwrap();

        assert_eq!(device.open_calls(), 1);
        assert!(crypto
            .is_device_open(Path::new("/dev/mapper/vol-b"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_open_with_wrong_passphrase_fails() {
        let (crypto, _) = volumes();
        let raw = PathBuf::from("/dev/longhorn/vol-b");

        crypto.encrypt_volume(&raw, "secret", &CryptoParams::default()).await.unwrap();
        let result = crypto.open_volume("vol-b", DataEngine::V1, &raw, "wrong").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_if_open() {
        let (crypto, _) = volumes();
        let raw = PathBuf::from("/dev/longhorn/vol-b");

        assert!(!crypto.close_if_open("vol-b", DataEngine::V2).await.unwrap());

        crypto.encrypt_volume(&raw, "secret", &CryptoParams::default()).await.unwrap();
        crypto.open_volume("vol-b", DataEngine::V2, &raw, "secret").await.unwrap();
        assert!(crypto
            .is_device_open(Path::new("/dev/mapper/vol-b-encrypted"))
            .await
            .unwrap());

        assert!(crypto.close_if_open("vol-b", DataEngine::V2).await.unwrap());
        assert!(!crypto
            .is_device_open(Path::new("/dev/mapper/vol-b-encrypted"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_resize_requires_open_mapping() {
        let (crypto, _) = volumes();
        let result = crypto.resize_volume("vol-b", DataEngine::V1, "secret").await;
        assert_matches!(result, Err(Error::Crypto { .. }));
    }

    #[tokio::test]
    async fn test_raw_paths_are_never_mapped() {
        let (crypto, _) = volumes();
        let status = crypto
            .device_encryption_status(Path::new("/dev/longhorn/vol-b"))
            .await
            .unwrap();
        assert_eq!(status, EncryptionStatus::unmapped("/dev/longhorn/vol-b"));
    }
}
