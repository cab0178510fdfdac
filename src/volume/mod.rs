//! Volume Descriptor
//!
//! Immutable description of the volume this instance serves, resolved once
//! at startup, plus the canonical device and mount path layout.

mod setup;

pub use setup::DeviceSetup;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::domain::CryptoParams;
use crate::error::{Error, Result};

/// Default directory holding raw volume block devices
pub const DEFAULT_DEV_ROOT: &str = "/dev/longhorn";

/// Default directory holding device-mapper nodes
pub const DEFAULT_MAPPER_ROOT: &str = "/dev/mapper";

/// Default directory under which volumes are mounted and exported
pub const DEFAULT_EXPORT_ROOT: &str = "/export";

/// Default NFSv4 lease lifetime in seconds
pub const DEFAULT_LEASE_LIFETIME: u32 = 60;

/// Default NFSv4 grace period in seconds
pub const DEFAULT_GRACE_PERIOD: u32 = 90;

/// Upper bound Ganesha accepts for lease lifetime and grace period
const MAX_NFS_TIMER_SECONDS: u32 = 180;

// =============================================================================
// Data Engine
// =============================================================================

/// Storage data engine backing the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataEngine {
    #[default]
    V1,
    V2,
}

impl std::fmt::Display for DataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataEngine::V1 => write!(f, "v1"),
            DataEngine::V2 => write!(f, "v2"),
        }
    }
}

impl FromStr for DataEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "v1" => Ok(DataEngine::V1),
            "v2" => Ok(DataEngine::V2),
            other => Err(Error::Config(format!("unknown data engine: {}", other))),
        }
    }
}

// =============================================================================
// Volume Descriptor
// =============================================================================

/// Everything needed to prepare and export one volume.
#[derive(Clone, Default)]
pub struct VolumeDescriptor {
    /// Volume name
    pub name: String,
    /// Volume must be opened through LUKS even if the passphrase is empty
    pub encrypted: bool,
    /// LUKS passphrase
    pub passphrase: String,
    /// LUKS format parameters
    pub crypto: CryptoParams,
    /// Requested filesystem type
    pub fs_type: String,
    /// Extra mount options
    pub mount_options: Vec<String>,
    /// Options passed to mkfs on first format
    pub format_options: Vec<String>,
    /// Data engine backing the volume
    pub data_engine: DataEngine,
    /// NFSv4 lease lifetime in seconds
    pub lease_lifetime: u32,
    /// NFSv4 grace period in seconds
    pub grace_period: u32,
    /// Take over the failover lease before serving
    pub fast_failover: bool,
}

impl VolumeDescriptor {
    /// Create a plain (unencrypted) descriptor with default tunables.
    pub fn new(name: impl Into<String>, fs_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fs_type: fs_type.into(),
            lease_lifetime: DEFAULT_LEASE_LIFETIME,
            grace_period: DEFAULT_GRACE_PERIOD,
            ..Default::default()
        }
    }

    /// Set the passphrase and mark the volume encrypted.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self.encrypted = true;
        self
    }

    /// Whether the volume is configured for encryption.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted || !self.passphrase.is_empty()
    }

    /// Split a colon separated mkfs option string.
    pub fn parse_format_options(raw: &str) -> Vec<String> {
        raw.split(':')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Reject descriptors that can never be served.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("volume name is required".to_string()));
        }
        if self.encrypted && self.passphrase.is_empty() {
            return Err(Error::MissingPassphrase {
                volume: self.name.clone(),
            });
        }
        if self.lease_lifetime == 0 || self.lease_lifetime > MAX_NFS_TIMER_SECONDS {
            return Err(Error::Config(format!(
                "lease lifetime {}s out of range 1..={}",
                self.lease_lifetime, MAX_NFS_TIMER_SECONDS
            )));
        }
        if self.grace_period > MAX_NFS_TIMER_SECONDS {
            return Err(Error::Config(format!(
                "grace period {}s out of range 0..={}",
                self.grace_period, MAX_NFS_TIMER_SECONDS
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for VolumeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDescriptor")
            .field("name", &self.name)
            .field("encrypted", &self.is_encrypted())
            .field("passphrase", &"<redacted>")
            .field("crypto", &self.crypto)
            .field("fs_type", &self.fs_type)
            .field("mount_options", &self.mount_options)
            .field("format_options", &self.format_options)
            .field("data_engine", &self.data_engine)
            .field("lease_lifetime", &self.lease_lifetime)
            .field("grace_period", &self.grace_period)
            .field("fast_failover", &self.fast_failover)
            .finish()
    }
}

// =============================================================================
// Path Layout
// =============================================================================

/// Canonical locations of a volume's devices and mount point.
#[derive(Debug, Clone)]
pub struct VolumePaths {
    pub dev_root: PathBuf,
    pub mapper_root: PathBuf,
    pub export_root: PathBuf,
}

impl Default for VolumePaths {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from(DEFAULT_DEV_ROOT),
            mapper_root: PathBuf::from(DEFAULT_MAPPER_ROOT),
            export_root: PathBuf::from(DEFAULT_EXPORT_ROOT),
        }
    }
}

impl VolumePaths {
    /// Raw block device of the volume.
    pub fn device_path(&self, volume: &str) -> PathBuf {
        self.dev_root.join(volume)
    }

    /// Device-mapper name used when the volume is opened through LUKS.
    pub fn mapping_name(&self, volume: &str, engine: DataEngine) -> String {
        match engine {
            DataEngine::V1 => volume.to_string(),
            DataEngine::V2 => format!("{}-encrypted", volume),
        }
    }

    /// Mapped plaintext device of the volume.
    pub fn mapped_device_path(&self, volume: &str, engine: DataEngine) -> PathBuf {
        self.mapper_root.join(self.mapping_name(volume, engine))
    }

    /// Whether a path lives under the device-mapper root.
    pub fn is_mapper_path(&self, path: &Path) -> bool {
        path.starts_with(&self.mapper_root)
    }

    /// Mount point and export path of the volume.
    pub fn mount_path(&self, volume: &str) -> PathBuf {
        self.export_root.join(volume)
    }
}
