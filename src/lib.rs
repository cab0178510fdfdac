//! Share Manager - Per-Volume NFS Export Daemon
//!
//! Prepares the block device of one storage volume (decrypting it when it is
//! LUKS encrypted), mounts it, exports it over NFSv4 through NFS-Ganesha and
//! keeps the export alive and healthy for as long as the volume is attached.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Share Manager                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Device Setup │───▶│ Orchestrator │───▶│  NFS Server  │       │
//! │  │ (mount/LUKS) │    │  (run loop)  │    │  (Ganesha)   │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                    ┌────────┴────────┐                           │
//! │              ┌─────▼─────┐     ┌─────▼──────┐                    │
//! │              │  Health   │     │   Lease    │                    │
//! │              │  Monitor  │     │ Coordinator│                    │
//! │              └───────────┘     └────────────┘                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`api`] - Control API server and client
//! - [`crypto`] - LUKS lifecycle of a volume's mapped device
//! - [`domain`] - Ports and value objects
//! - [`error`] - Error types
//! - [`health`] - Mount health supervision and probe state
//! - [`lease`] - Fast failover lease coordinator
//! - [`manager`] - Volume export orchestrator
//! - [`metrics`] - Prometheus metrics
//! - [`nfs`] - Ganesha configuration, export table and daemon
//! - [`volume`] - Volume descriptor, path layout and device setup

pub mod adapters;
pub mod api;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod health;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod nfs;
pub mod volume;

// Re-export commonly used types
pub use error::{Error, Result};
pub use lease::LeaseCoordinator;
pub use manager::{Dependencies, ManagerConfig, ShareManager, ShareState, ShareStatus};
pub use nfs::NfsServer;
pub use volume::{DataEngine, VolumeDescriptor, VolumePaths};
