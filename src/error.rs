//! Error types for the Share Manager

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Share Manager
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control API client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encrypted volume started without a passphrase
    #[error("Missing passphrase for encrypted volume {volume}")]
    MissingPassphrase { volume: String },

    /// External tool exited unsuccessfully
    #[error("Command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    /// Mount operation failed
    #[error("Mount operation on {path} failed: {reason}")]
    Mount { path: String, reason: String },

    /// Crypto device operation failed
    #[error("Crypto operation on {device} failed: {reason}")]
    Crypto { device: String, reason: String },

    // =========================================================================
    // Lease Errors
    // =========================================================================
    /// Fast failover requested without a lease client
    #[error("Kubernetes API client is unset")]
    LeaseClientUnset,

    /// Lease was written by someone else since it was read
    #[error("Lease {name} was modified concurrently")]
    LeaseConflict { name: String },

    /// Lease record missing or unusable
    #[error("Lease error: {0}")]
    Lease(String),

    // =========================================================================
    // NFS Errors
    // =========================================================================
    /// Export table could not be updated
    #[error("Export for volume {volume} failed: {reason}")]
    Export { volume: String, reason: String },

    /// NFS server process failure
    #[error("NFS server error: {0}")]
    NfsServer(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a command error from a program name and a failure description.
    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from a write that lost an optimistic
    /// concurrency race.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::LeaseConflict { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Whether the error is a configuration problem that no retry can fix.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::MissingPassphrase { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MissingPassphrase {
            volume: "vol-a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing passphrase for encrypted volume vol-a"
        );

        let err = Error::command("mkfs.ext4", "exit status 1");
        assert_eq!(err.to_string(), "Command 'mkfs.ext4' failed: exit status 1");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::LeaseConflict {
            name: "vol-a".to_string()
        }
        .is_conflict());
        assert!(!Error::LeaseClientUnset.is_conflict());

        assert!(Error::Config("bad".to_string()).is_config());
        assert!(Error::MissingPassphrase {
            volume: "vol-a".to_string()
        }
        .is_config());
        assert!(!Error::Internal("x".to_string()).is_config());
    }
}
