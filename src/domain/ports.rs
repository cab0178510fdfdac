//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the external collaborators that the share manager
//! depends on. Infrastructure adapters implement these traits to provide
//! concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  Mounter │ CryptoDevice │ LeaseStore │ NfsDaemon    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ SystemMounter │ Cryptsetup │ KubeLeaseStore │ Ganesha│    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Disk format reported for a LUKS container.
pub const LUKS_FORMAT: &str = "crypto_LUKS";

/// Disk format reported when the device carries a partition table.
const PARTITION_TABLE_FORMAT: &str = "unknown data";

// =============================================================================
// Value Objects
// =============================================================================

/// On-disk format of a block device as reported by the mount utility.
///
/// An empty value means the device is unformatted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskFormat(pub String);

impl DiskFormat {
    pub fn new(format: impl Into<String>) -> Self {
        Self(format.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The device has no recognizable signature.
    pub fn is_unformatted(&self) -> bool {
        self.0.is_empty()
    }

    /// The device is a LUKS container.
    pub fn is_luks(&self) -> bool {
        self.0 == LUKS_FORMAT
    }

    /// The device carries a usable filesystem signature (not a partition table).
    pub fn is_filesystem(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(PARTITION_TABLE_FORMAT)
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "<unformatted>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Optional LUKS format parameters. Unset values use the tool defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoParams {
    pub cipher: Option<String>,
    pub hash: Option<String>,
    pub key_size: Option<String>,
    pub pbkdf: Option<String>,
}

/// Result of a crypto status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionStatus {
    /// Backing device of the mapping, or the queried path when not mapped
    pub mapped_device: String,
    /// Mapper name, empty when the path is not an active mapping
    pub mapper_name: String,
}

impl EncryptionStatus {
    /// Status for a path that is not an active mapping.
    pub fn unmapped(device: impl Into<String>) -> Self {
        Self {
            mapped_device: device.into(),
            mapper_name: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.mapper_name.is_empty()
    }
}

/// Lease record used for fast failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Lease name, equal to the volume name
    pub name: String,
    /// Identity of the current holder
    pub holder_identity: String,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes
    pub lease_transitions: i32,
    pub lease_duration_seconds: Option<i32>,
    /// Opaque version used for optimistic concurrency
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    pub fn new(name: impl Into<String>, holder_identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            holder_identity: holder_identity.into(),
            acquire_time: None,
            renew_time: None,
            lease_transitions: 0,
            lease_duration_seconds: None,
            resource_version: None,
        }
    }
}

// =============================================================================
// Mount/Format Port
// =============================================================================

/// Port for block device and filesystem primitives.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Detect the on-disk format of a device.
    async fn disk_format(&self, device: &Path) -> Result<DiskFormat>;

    /// Whether the path exists and is a block device.
    async fn is_block_device(&self, path: &Path) -> bool;

    /// Whether the path is currently a mount point.
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Format the device when unformatted, then mount it at `path`.
    async fn format_and_mount(
        &self,
        device: &Path,
        path: &Path,
        fs_type: &str,
        mount_options: &[String],
        format_options: &[String],
    ) -> Result<()>;

    /// Grow the filesystem to the device size. Returns whether it changed.
    async fn resize(&self, device: &Path, path: &Path) -> Result<bool>;

    /// Unmount and clean up the mount point. Missing mounts are not an error.
    async fn unmount(&self, path: &Path) -> Result<()>;

    /// Change permissions of the path.
    async fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    /// Liveness probe: list the directory.
    async fn probe(&self, path: &Path) -> Result<()>;

    /// Whether the mount at `path` is read-only.
    async fn is_read_only(&self, path: &Path) -> Result<bool>;

    /// Remount the mount at `path` read-write.
    async fn remount_read_write(&self, path: &Path) -> Result<()>;
}

// =============================================================================
// Crypto Device Port
// =============================================================================

/// Port for LUKS/dm-crypt primitives.
#[async_trait]
pub trait CryptoDevice: Send + Sync {
    /// Format the device as a LUKS container.
    async fn format(&self, device: &Path, passphrase: &str, params: &CryptoParams) -> Result<()>;

    /// Open the LUKS device under the given mapping name.
    async fn open(&self, mapping_name: &str, device: &Path, passphrase: &str) -> Result<()>;

    /// Close the mapping.
    async fn close(&self, mapping_name: &str) -> Result<()>;

    /// Grow an open mapping to its backing device size.
    async fn resize(&self, mapping_name: &str, passphrase: &str) -> Result<()>;

    /// Report whether `device` is an active mapping and what backs it.
    async fn status(&self, device: &Path) -> Result<EncryptionStatus>;
}

// =============================================================================
// Lease Port
// =============================================================================

/// Port for the shared lease object store.
///
/// The store is bound to one namespace; records are addressed by name.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Fetch the lease record.
    async fn get(&self, name: &str) -> Result<LeaseRecord>;

    /// Write the lease record. Stale writes are rejected with a conflict.
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord>;
}

// =============================================================================
// NFS Daemon Port
// =============================================================================

/// Port for the external NFS server process.
#[async_trait]
pub trait NfsDaemon: Send + Sync {
    /// Run the daemon in the foreground until it exits or `cancel` fires.
    async fn run(&self, config_path: &Path, cancel: CancellationToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_format_classification() {
        assert!(DiskFormat::default().is_unformatted());
        assert!(!DiskFormat::default().is_filesystem());

        let luks = DiskFormat::new(LUKS_FORMAT);
        assert!(luks.is_luks());
        assert!(luks.is_filesystem());

        let partitioned = DiskFormat::new("unknown data, probably partitions");
        assert!(!partitioned.is_unformatted());
        assert!(!partitioned.is_filesystem());

        assert!(DiskFormat::new("xfs").is_filesystem());
    }

    #[test]
    fn test_disk_format_display() {
        assert_eq!(DiskFormat::default().to_string(), "<unformatted>");
        assert_eq!(DiskFormat::new("ext4").to_string(), "ext4");
    }

    #[test]
    fn test_encryption_status() {
        let status = EncryptionStatus::unmapped("/dev/longhorn/vol-a");
        assert!(!status.is_open());
        assert_eq!(status.mapped_device, "/dev/longhorn/vol-a");

        let status = EncryptionStatus {
            mapped_device: "/dev/longhorn/vol-a".to_string(),
            mapper_name: "vol-a".to_string(),
        };
        assert!(status.is_open());
    }
}
