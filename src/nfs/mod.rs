//! Export Process Manager
//!
//! Owns the Ganesha configuration file, the export table and the daemon
//! lifecycle for the volume this instance serves.

pub mod config;
mod exporter;

pub use exporter::Exporter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::NfsDaemon;
use crate::error::{Error, Result};
use crate::volume::VolumeDescriptor;

/// Default location of the generated Ganesha configuration
pub const DEFAULT_CONFIG_PATH: &str = "/tmp/vfs.conf";

/// Open file limit requested for the daemon
pub const NOFILE_LIMIT: u64 = 1024 * 1024;

/// NFS server for one volume.
pub struct NfsServer {
    config_path: PathBuf,
    exporter: Exporter,
    daemon: Arc<dyn NfsDaemon>,
}

impl NfsServer {
    /// Prepare the config file and create the volume's export.
    ///
    /// A missing config is generated from the default template; an existing
    /// one only gets its lease, grace and log fields rewritten.
    pub fn new(
        config_path: impl Into<PathBuf>,
        export_root: impl Into<PathBuf>,
        volume: &VolumeDescriptor,
        daemon: Arc<dyn NfsDaemon>,
    ) -> Result<Self> {
        if let Err(e) = raise_nofile_limit(NOFILE_LIMIT) {
            warn!(
                "Error setting RLIMIT_NOFILE, there may be 'Too many open files' errors later: {}",
                e
            );
        }

        let config_path = config_path.into();
        let log_path = config::log_path_for_parent(parent_pid());
        prepare_config(&config_path, log_path, volume.lease_lifetime, volume.grace_period)?;

        let exporter = Exporter::load(&config_path, export_root)?;
        exporter.create_export(&volume.name)?;

        Ok(Self {
            config_path,
            exporter,
            daemon,
        })
    }

    pub fn create_export(&self, volume: &str) -> Result<u16> {
        self.exporter.create_export(volume)
    }

    pub fn delete_export(&self, volume: &str) -> Result<u16> {
        self.exporter.delete_export(volume)
    }

    pub fn get_export(&self, volume: &str) -> u16 {
        self.exporter.get_export(volume)
    }

    /// Run the daemon in the foreground until it exits or `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.daemon.run(&self.config_path, cancel).await
    }
}

impl std::fmt::Debug for NfsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsServer")
            .field("config_path", &self.config_path)
            .field("exporter", &self.exporter)
            .finish()
    }
}

/// Write the default config, or update the tunables of an existing one.
pub fn prepare_config(
    config_path: &Path,
    log_path: &str,
    lease_lifetime: u32,
    grace_period: u32,
) -> Result<()> {
    if !config_path.exists() {
        info!(path = %config_path.display(), "Writing default NFS config");
        let contents = config::render_default_config(log_path, lease_lifetime, grace_period);
        return config::write_atomic(config_path, &contents).map_err(|e| {
            Error::NfsServer(format!(
                "error writing nfs config {}: {}",
                config_path.display(),
                e
            ))
        });
    }

    let mut contents = std::fs::read_to_string(config_path)?;
    let updates = [
        ("Lease_Lifetime", lease_lifetime.to_string()),
        ("Grace_Period", grace_period.to_string()),
        ("destination", format!("\"{}\"", log_path)),
    ];
    for (key, value) in updates {
        let (updated, found) = config::set_field(&contents, key, &value);
        if !found {
            warn!(key, path = %config_path.display(), "NFS config has no such field, leaving as is");
        }
        contents = updated;
    }
    config::write_atomic(config_path, &contents)
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

#[cfg(unix)]
fn raise_nofile_limit(limit: u64) -> std::io::Result<()> {
    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlimit is a valid, writable struct for the duration of the call.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    info!(cur = rlimit.rlim_cur, max = rlimit.rlim_max, "Starting RLIMIT_NOFILE");

    rlimit.rlim_cur = limit as libc::rlim_t;
    rlimit.rlim_max = limit as libc::rlim_t;
    // SAFETY: rlimit is a valid struct for the duration of the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    info!(cur = rlimit.rlim_cur, max = rlimit.rlim_max, "Ending RLIMIT_NOFILE");
    Ok(())
}

#[cfg(not(unix))]
fn raise_nofile_limit(_limit: u64) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FakeNfsDaemon;
    use std::fs;

    #[test]
    fn test_new_writes_default_config_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vfs.conf");
        let vol = VolumeDescriptor::new("vol-a", "ext4");

        let server = NfsServer::new(
            &config_path,
            "/export",
            &vol,
            Arc::new(FakeNfsDaemon::new()),
        )
        .unwrap();

        assert_eq!(server.get_export("vol-a"), 1);
        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("NFS_Core_Param"));
        assert!(contents.contains("Grace_Period = 90;"));
        assert!(contents.contains("Pseudo = /vol-a;"));
    }

    #[test]
    fn test_existing_config_gets_targeted_updates() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vfs.conf");
        prepare_config(&config_path, config::FILE_LOG_PATH, 60, 90).unwrap();
        let original = fs::read_to_string(&config_path).unwrap();
        let with_comment = format!("# operator note\n{}", original);
        fs::write(&config_path, &with_comment).unwrap();

        prepare_config(&config_path, config::INIT_LOG_PATH, 30, 0).unwrap();

        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.starts_with("# operator note\n"));
        assert!(contents.contains("Lease_Lifetime = 30;"));
        assert!(contents.contains("Grace_Period = 0;"));
        assert!(contents.contains("destination = \"/proc/1/fd/1\";"));
    }

    #[test]
    fn test_new_keeps_existing_export_id() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vfs.conf");
        let daemon = Arc::new(FakeNfsDaemon::new());

        let first = NfsServer::new(
            &config_path,
            "/export",
            &VolumeDescriptor::new("vol-b", "ext4"),
            daemon.clone(),
        )
        .unwrap();
        assert_eq!(first.get_export("vol-b"), 1);

        let second = NfsServer::new(
            &config_path,
            "/export",
            &VolumeDescriptor::new("vol-a", "ext4"),
            daemon,
        )
        .unwrap();
        assert_eq!(second.get_export("vol-b"), 1);
        assert_eq!(second.get_export("vol-a"), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vfs.conf");
        let daemon = Arc::new(FakeNfsDaemon::new());
        let server = NfsServer::new(
            &config_path,
            "/export",
            &VolumeDescriptor::new("vol-a", "ext4"),
            daemon.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        server.run(cancel).await.unwrap();
        assert_eq!(daemon.starts(), 1);
    }
}
