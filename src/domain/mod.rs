//! Domain Layer
//!
//! Port traits for the external collaborators of the share manager and the
//! value objects exchanged with them.
//!
//! # Usage
//!
//! ```ignore
//! use share_manager::domain::ports::{Mounter, DiskFormat};
//!
//! async fn needs_format<M: Mounter>(mounter: &M, device: &Path) -> Result<bool> {
//!     Ok(mounter.disk_format(device).await?.is_unformatted())
//! }
//! ```

pub mod ports;

pub use ports::{
    // Port traits
    CryptoDevice,
    // Value objects
    CryptoParams,
    DiskFormat,
    EncryptionStatus,
    LeaseRecord,
    LeaseStore,
    Mounter,
    NfsDaemon,
    LUKS_FORMAT,
};
