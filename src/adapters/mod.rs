//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │   Mounter │ CryptoDevice │ LeaseStore │ NfsDaemon          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ SystemMounter │ CryptsetupDevice │ KubeLeaseStore          │ │
//! │  │ GaneshaDaemon │ in-memory fakes (feature `test-util`)       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use share_manager::adapters::{CryptsetupDevice, HostCommand, SystemMounter};
//! use share_manager::domain::Mounter;
//!
//! let mounter = SystemMounter::new(HostCommand::new());
//! let format = mounter.disk_format(Path::new("/dev/longhorn/vol-a")).await?;
//! ```

mod command;
mod cryptsetup;
mod ganesha;
mod kubernetes;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
mod mount;

pub use command::{CommandOutput, HostCommand, DEFAULT_COMMAND_TIMEOUT};
pub use cryptsetup::{parse_status_output, CryptsetupDevice};
pub use ganesha::{GaneshaDaemon, DEFAULT_PID_FILE, DEFAULT_STOP_TIMEOUT};
pub use kubernetes::{pod_node_name, KubeLeaseStore};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{FakeCryptoDevice, FakeMounter, FakeNfsDaemon, InMemoryLeaseStore};
pub use mount::{
    parse_blkid_output, parse_mounts, MountEntry, SystemMounter, DEFAULT_PROBE_TIMEOUT,
};
