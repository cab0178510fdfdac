//! System Mount Adapter
//!
//! Implements the `Mounter` port with the host's `blkid`, `mkfs.*`, `mount`,
//! `umount`, `resize2fs` and `xfs_growfs` plus `/proc/mounts` inspection.

use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::command::{CommandOutput, HostCommand};
use crate::domain::{DiskFormat, Mounter};
use crate::error::{Error, Result};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Exit code of `blkid -p` when no signature was found
const BLKID_NOTHING_FOUND: i32 = 2;

/// Upper bound for a liveness directory listing
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Parse `/proc/mounts` content. Octal escapes in paths are decoded.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                path: PathBuf::from(unescape_mount_field(path)),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `blkid -p -s TYPE -s PTTYPE -o export` output into a disk format.
pub fn parse_blkid_output(output: &str) -> DiskFormat {
    let mut fs_type = None;
    let mut partition_table = None;
    for line in output.lines() {
        match line.trim().split_once('=') {
            Some(("TYPE", value)) => fs_type = Some(value.to_string()),
            Some(("PTTYPE", value)) => partition_table = Some(value.to_string()),
            _ => {}
        }
    }

    match (fs_type, partition_table) {
        (Some(fs), _) => DiskFormat::new(fs),
        (None, Some(_)) => DiskFormat::new("unknown data, probably partitions"),
        (None, None) => DiskFormat::default(),
    }
}

/// Whether a resize tool printed `marker` on either stream.
///
/// `resize2fs` reports "Nothing to do" on stderr.
fn reports(out: &CommandOutput, marker: &str) -> bool {
    out.stdout.contains(marker) || out.stderr.contains(marker)
}

/// `Mounter` backed by host tools.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    command: HostCommand,
    mounts_file: PathBuf,
    probe_timeout: Duration,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self {
            command: HostCommand::new(),
            mounts_file: PathBuf::from(PROC_MOUNTS),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl SystemMounter {
    pub fn new(command: HostCommand) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    /// Read mount state from another file instead of `/proc/mounts`.
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    async fn mounts(&self) -> Result<Vec<MountEntry>> {
        let contents = tokio::fs::read_to_string(&self.mounts_file).await?;
        Ok(parse_mounts(&contents))
    }

    async fn mount_entry(&self, path: &Path) -> Result<Option<MountEntry>> {
        Ok(self
            .mounts()
            .await?
            .into_iter()
            .rev()
            .find(|entry| entry.path == path))
    }

    /// Run a command and fail on a non-zero exit, keeping both streams.
    async fn checked_output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let out = self.command.output(program, args, None).await?;
        if !out.success() {
            return Err(Error::command(
                program,
                format!("exit code {}: {}", out.status, out.diagnostic()),
            ));
        }
        Ok(out)
    }

    async fn make_filesystem(
        &self,
        device: &Path,
        fs_type: &str,
        format_options: &[String],
    ) -> Result<()> {
        let program = format!("mkfs.{}", fs_type);
        let device = device.display().to_string();
        let mut args: Vec<&str> = Vec::new();
        if fs_type.starts_with("ext") {
            args.extend(["-F", "-m0"]);
        }
        args.extend(format_options.iter().map(String::as_str));
        args.push(device.as_str());

        info!(device = %device, fs_type = %fs_type, "Formatting device");
        self.command.run(&program, &args, None).await?;
        Ok(())
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    #[instrument(skip(self))]
    async fn disk_format(&self, device: &Path) -> Result<DiskFormat> {
        let device = device.display().to_string();
        let out = self
            .command
            .output(
                "blkid",
                &["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device.as_str()],
                None,
            )
            .await?;

        match out.status {
            0 => Ok(parse_blkid_output(&out.stdout)),
            BLKID_NOTHING_FOUND => Ok(DiskFormat::default()),
            code => Err(Error::command(
                "blkid",
                format!("exit code {}: {}", code, out.diagnostic()),
            )),
        }
    }

    async fn is_block_device(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.file_type().is_block_device(),
            Err(_) => false,
        }
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mount_entry(path).await?.is_some())
    }

    #[instrument(skip(self, mount_options, format_options))]
    async fn format_and_mount(
        &self,
        device: &Path,
        path: &Path,
        fs_type: &str,
        mount_options: &[String],
        format_options: &[String],
    ) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;

        if self.disk_format(device).await?.is_unformatted() {
            self.make_filesystem(device, fs_type, format_options)
                .await?;
        }

        let device = device.display().to_string();
        let target = path.display().to_string();
        let options = mount_options.join(",");
        let mut args = vec!["-t", fs_type];
        if !options.is_empty() {
            args.extend(["-o", options.as_str()]);
        }
        args.extend([device.as_str(), target.as_str()]);

        self.command
            .run("mount", &args, None)
            .await
            .map_err(|e| Error::Mount {
                path: target.clone(),
                reason: e.to_string(),
            })?;
        info!(device = %device, path = %target, fs_type = %fs_type, "Mounted volume");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resize(&self, device: &Path, path: &Path) -> Result<bool> {
        let format = self.disk_format(device).await?;
        match format.as_str() {
            "ext2" | "ext3" | "ext4" => {
                let device = device.display().to_string();
                let out = self
                    .checked_output("resize2fs", &[device.as_str()])
                    .await?;
                Ok(!reports(&out, "Nothing to do"))
            }
            "xfs" => {
                let target = path.display().to_string();
                let out = self
                    .checked_output("xfs_growfs", &["-d", target.as_str()])
                    .await?;
                Ok(reports(&out, "data blocks changed"))
            }
            other => {
                warn!(fs_type = %other, "Resize is not supported for filesystem");
                Ok(false)
            }
        }
    }

    #[instrument(skip(self))]
    async fn unmount(&self, path: &Path) -> Result<()> {
        if self.is_mount_point(path).await? {
            let target = path.display().to_string();
            self.command
                .run("umount", &[target.as_str()], None)
                .await
                .map_err(|e| Error::Mount {
                    path: target.clone(),
                    reason: e.to_string(),
                })?;
        }

        match tokio::fs::remove_dir(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed mount point");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn probe(&self, path: &Path) -> Result<()> {
        let listing = async {
            let mut entries = tokio::fs::read_dir(path).await?;
            entries.next_entry().await?;
            Ok::<_, std::io::Error>(())
        };

        timeout(self.probe_timeout, listing)
            .await
            .map_err(|_| Error::Mount {
                path: path.display().to_string(),
                reason: format!("listing timed out after {:?}", self.probe_timeout),
            })?
            .map_err(|e| Error::Mount {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn is_read_only(&self, path: &Path) -> Result<bool> {
        Ok(self
            .mount_entry(path)
            .await?
            .map(|entry| entry.is_read_only())
            .unwrap_or(false))
    }

    #[instrument(skip(self))]
    async fn remount_read_write(&self, path: &Path) -> Result<()> {
        let target = path.display().to_string();
        self.command
            .run("mount", &["-o", "remount,rw", target.as_str()], None)
            .await
            .map(|_| ())
    }
}
