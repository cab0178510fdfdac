//! NFS-Ganesha Adapter
//!
//! Runs `ganesha.nfsd` in the foreground as a child process. Cancellation
//! sends SIGTERM, waits for a bounded stop period and then kills the child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::NfsDaemon;
use crate::error::{Error, Result};

/// Default ganesha pid file
pub const DEFAULT_PID_FILE: &str = "/var/run/ganesha.pid";

const GANESHA_BINARY: &str = "ganesha.nfsd";

/// Grace given to the daemon between SIGTERM and kill
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// `NfsDaemon` backed by the `ganesha.nfsd` binary.
#[derive(Debug, Clone)]
pub struct GaneshaDaemon {
    binary: PathBuf,
    pid_file: PathBuf,
    stop_timeout: Duration,
}

impl Default for GaneshaDaemon {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(GANESHA_BINARY),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl GaneshaDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_pid_file(mut self, pid_file: impl Into<PathBuf>) -> Self {
        self.pid_file = pid_file.into();
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Foreground daemon arguments.
    pub fn args(&self, config_path: &Path) -> Vec<String> {
        vec![
            "-F".to_string(),
            "-p".to_string(),
            self.pid_file.display().to_string(),
            "-f".to_string(),
            config_path.display().to_string(),
        ]
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: kill(2) has no memory safety requirements.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, "Failed to signal NFS server: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[async_trait]
impl NfsDaemon for GaneshaDaemon {
    #[instrument(skip(self, cancel), fields(config = %config_path.display()))]
    async fn run(&self, config_path: &Path, cancel: CancellationToken) -> Result<()> {
        info!("Running NFS server");
        let child = Command::new(&self.binary)
            .args(self.args(config_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::NfsServer(format!("failed to start {}: {}", self.binary.display(), e)))?;
        let pid = child.id();

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        tokio::select! {
            result = &mut wait => {
                let output = result?;
                if output.status.success() {
                    return Ok(());
                }
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Err(Error::NfsServer(format!(
                    "ganesha.nfsd failed with {}, output: {}",
                    output.status,
                    combined.trim()
                )))
            }
            _ = cancel.cancelled() => {
                info!("Stopping NFS server");
                if let Some(pid) = pid {
                    terminate(pid);
                }
                if tokio::time::timeout(self.stop_timeout, &mut wait).await.is_err() {
                    warn!(timeout = ?self.stop_timeout, "NFS server did not stop in time, killing it");
                }
                Ok(())
            }
        }
    }
}
