//! Cryptsetup Adapter
//!
//! Implements the `CryptoDevice` port with the host `cryptsetup` binary.
//! Passphrases are always fed on stdin, never on the command line.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::command::HostCommand;
use crate::domain::{CryptoDevice, CryptoParams, EncryptionStatus};
use crate::error::{Error, Result};

const CRYPTSETUP: &str = "cryptsetup";

/// Parse `cryptsetup status <name>` output.
///
/// ```text
/// /dev/mapper/vol-b is active and is in use.
///   type:    LUKS2
///   cipher:  aes-xts-plain64
///   device:  /dev/longhorn/vol-b
/// ```
///
/// Returns `None` when the first line does not report an active mapping.
pub fn parse_status_output(device: &str, mapper_name: &str, output: &str) -> Result<Option<EncryptionStatus>> {
    let mut lines = output.lines();
    let first = match lines.next() {
        Some(line) => line,
        None => {
            return Err(Error::Crypto {
                device: device.to_string(),
                reason: "encryption status returned no output".to_string(),
            })
        }
    };

    if !first.contains(" is active") {
        return Ok(None);
    }

    for line in lines {
        if let Some((key, value)) = line.trim().split_once(':') {
            if key.trim() == "device" {
                return Ok(Some(EncryptionStatus {
                    mapped_device: value.trim().to_string(),
                    mapper_name: mapper_name.to_string(),
                }));
            }
        }
    }

    Err(Error::Crypto {
        device: device.to_string(),
        reason: "mapped device not found in status output".to_string(),
    })
}

/// Build the `luksFormat` argument vector for a device.
fn format_args<'a>(device: &'a str, params: &'a CryptoParams) -> Vec<&'a str> {
    let mut args = vec!["-q", "luksFormat", "--type", "luks2"];
    let optional = [
        ("--cipher", &params.cipher),
        ("--hash", &params.hash),
        ("--key-size", &params.key_size),
        ("--pbkdf", &params.pbkdf),
    ];
    for (flag, value) in optional {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            args.extend([flag, value]);
        }
    }
    args.extend([device, "-d", "-"]);
    args
}

/// `CryptoDevice` backed by host `cryptsetup`.
#[derive(Debug, Clone, Default)]
pub struct CryptsetupDevice {
    command: HostCommand,
}

impl CryptsetupDevice {
    pub fn new(command: HostCommand) -> Self {
        Self { command }
    }

    fn crypto_err(device: &str, e: Error) -> Error {
        Error::Crypto {
            device: device.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl CryptoDevice for CryptsetupDevice {
    #[instrument(skip(self, passphrase, params))]
    async fn format(&self, device: &Path, passphrase: &str, params: &CryptoParams) -> Result<()> {
        let device = device.display().to_string();
        let args = format_args(&device, params);
        self.command
            .run(CRYPTSETUP, &args, Some(passphrase.as_bytes()))
            .await
            .map_err(|e| Self::crypto_err(&device, e))?;
        Ok(())
    }

    #[instrument(skip(self, passphrase))]
    async fn open(&self, mapping_name: &str, device: &Path, passphrase: &str) -> Result<()> {
        let device = device.display().to_string();
        self.command
            .run(
                CRYPTSETUP,
                &["luksOpen", device.as_str(), mapping_name, "-d", "-"],
                Some(passphrase.as_bytes()),
            )
            .await
            .map_err(|e| Self::crypto_err(&device, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn close(&self, mapping_name: &str) -> Result<()> {
        let out = self
            .command
            .output(CRYPTSETUP, &["luksClose", mapping_name], None)
            .await?;
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("doesn't exist") || lower.contains("not active") {
            debug!(mapping = %mapping_name, "Mapping already closed");
            return Ok(());
        }
        Err(Error::Crypto {
            device: mapping_name.to_string(),
            reason: format!("exit code {}: {}", out.status, diagnostic),
        })
    }

    #[instrument(skip(self, passphrase))]
    async fn resize(&self, mapping_name: &str, passphrase: &str) -> Result<()> {
        self.command
            .run(
                CRYPTSETUP,
                &["resize", mapping_name, "-d", "-"],
                Some(passphrase.as_bytes()),
            )
            .await
            .map_err(|e| Self::crypto_err(mapping_name, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn status(&self, device: &Path) -> Result<EncryptionStatus> {
        let device_str = device.display().to_string();
        let mapper_name = match device.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Ok(EncryptionStatus::unmapped(device_str)),
        };

        let out = self
            .command
            .output(CRYPTSETUP, &["status", mapper_name.as_str()], None)
            .await?;
        if !out.success() {
            debug!(device = %device_str, "Device is not an active LUKS device");
            return Ok(EncryptionStatus::unmapped(device_str));
        }

        Ok(parse_status_output(&device_str, &mapper_name, &out.stdout)?
            .unwrap_or_else(|| EncryptionStatus::unmapped(device_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const ACTIVE: &str = "\
/dev/mapper/vol-b is active and is in use.
  type:    LUKS2
  cipher:  aes-xts-plain64
  keysize: 256 bits
  key location: keyring
  device:  /dev/longhorn/vol-b
  sector size:  512
  offset:  32768 sectors
  size:    110592 sectors
  mode:    read/write
";

    #[test]
    fn test_parse_active_status() {
        let status = parse_status_output("/dev/mapper/vol-b", "vol-b", ACTIVE)
            .unwrap()
            .unwrap();
        assert_eq!(status.mapped_device, "/dev/longhorn/vol-b");
        assert_eq!(status.mapper_name, "vol-b");
        assert!(status.is_open());
    }

    #[test]
    fn test_parse_inactive_status() {
        let status = parse_status_output(
            "/dev/mapper/vol-b",
            "vol-b",
            "/dev/mapper/vol-b is inactive.\n",
        )
        .unwrap();
        assert!(status.is_none());
    }

    #[test]
    fn test_parse_status_without_device_line() {
        let result = parse_status_output(
            "/dev/mapper/vol-b",
            "vol-b",
            "/dev/mapper/vol-b is active.\n  type: LUKS2\n",
        );
        assert_matches!(result, Err(Error::Crypto { .. }));

        let result = parse_status_output("/dev/mapper/vol-b", "vol-b", "");
        assert_matches!(result, Err(Error::Crypto { .. }));
    }

    #[test]
    fn test_format_args() {
        let params = CryptoParams::default();
        assert_eq!(
            format_args("/dev/longhorn/vol-b", &params),
            vec!["-q", "luksFormat", "--type", "luks2", "/dev/longhorn/vol-b", "-d", "-"]
        );

        let params = CryptoParams {
            cipher: Some("aes-xts-plain64".to_string()),
            hash: Some(String::new()),
            key_size: Some("256".to_string()),
            pbkdf: Some("argon2i".to_string()),
        };
        assert_eq!(
            format_args("/dev/longhorn/vol-b", &params),
            vec![
                "-q",
                "luksFormat",
                "--type",
                "luks2",
                "--cipher",
                "aes-xts-plain64",
                "--key-size",
                "256",
                "--pbkdf",
                "argon2i",
                "/dev/longhorn/vol-b",
                "-d",
                "-"
            ]
        );
    }
}
