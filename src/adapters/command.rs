//! Host Command Execution
//!
//! Thin async wrapper around external tools (`blkid`, `mkfs`, `mount`,
//! `cryptsetup`, ...). Optionally enters the host's mount and IPC namespaces
//! through `nsenter` so device-mapper operations land on the host.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};

/// Default timeout for a single host command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs host commands with a timeout.
#[derive(Debug, Clone)]
pub struct HostCommand {
    /// Host `/proc` to enter namespaces through, e.g. `/host/proc`
    host_proc: Option<PathBuf>,
    timeout: Duration,
}

impl Default for HostCommand {
    fn default() -> Self {
        Self {
            host_proc: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl HostCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the mount and IPC namespaces of the host's init process.
    pub fn with_host_namespaces(mut self, host_proc: impl Into<PathBuf>) -> Self {
        self.host_proc = Some(host_proc.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the program and argument vector, wrapped in `nsenter` if needed.
    pub fn command_line(&self, program: &str, args: &[&str]) -> (String, Vec<String>) {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        match &self.host_proc {
            Some(proc_dir) => {
                let ns = proc_dir.join("1").join("ns");
                let mut wrapped = vec![
                    format!("--mount={}", ns.join("mnt").display()),
                    format!("--ipc={}", ns.join("ipc").display()),
                    "--".to_string(),
                    program.to_string(),
                ];
                wrapped.extend(args);
                ("nsenter".to_string(), wrapped)
            }
            None => (program.to_string(), args),
        }
    }

    /// Run a command, feeding `input` on stdin, and capture its output.
    ///
    /// A non-zero exit status is returned in the output, not as an error.
    pub async fn output(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        let (binary, argv) = self.command_line(program, args);
        debug!(program = %program, args = ?args, "Running host command");

        let mut command = Command::new(&binary);
        command
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::command(program, format!("failed to spawn: {}", e)))?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload).await?;
                stdin.shutdown().await?;
            }
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::command(program, format!("timed out after {:?}", self.timeout))
            })??;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command and fail unless it exits successfully.
    pub async fn run(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> Result<String> {
        let out = self.output(program, args, input).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        Err(Error::command(
            program,
            format!("exit code {}: {}", out.status, out.diagnostic()),
        ))
    }
}
