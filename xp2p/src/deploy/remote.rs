//! Remote command execution over OpenSSH
//!
//! Every subprocess is spawned with `kill_on_drop(true)`, so dropping the
//! caller's future also terminates the `ssh`/`scp` child.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::errors::Xp2pError;

/// SSH destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    /// `user@host`, or the bare host without a user
    pub fn address(&self) -> String {
        if self.user.trim().is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user.trim(), self.host)
        }
    }
}

/// Output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit status into an error naming `what`
    pub fn check(self, what: &str) -> Result<Self, Xp2pError> {
        if self.success() {
            return Ok(self);
        }
        let detail = [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Err(Xp2pError::RemoteError(if detail.is_empty() {
            format!("{what} exited with status {}", self.status)
        } else {
            format!("{what} exited with status {}: {detail}", self.status)
        }))
    }
}

/// Keeps an SSH port forward open until dropped
#[derive(Debug, Default)]
pub struct ForwardGuard {
    child: Option<Child>,
}

impl ForwardGuard {
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// Guard with no process behind it
    pub fn detached() -> Self {
        Self { child: None }
    }

    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Verify the local tooling needed to reach the remote host
    async fn check_prerequisites(&self) -> Result<(), Xp2pError>;

    /// Run a shell command on the remote host
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<ExecOutput, Xp2pError>;

    /// Copy a local file to `remote` on the remote host
    async fn copy(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<(), Xp2pError>;

    /// Forward `127.0.0.1:<local_port>` to `127.0.0.1:<remote_port>` on the remote host
    async fn forward(
        &self,
        target: &SshTarget,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardGuard, Xp2pError>;
}

/// Resolved OpenSSH client binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisites {
    pub ssh: PathBuf,
    pub scp: PathBuf,
}

/// Resolve `ssh` and `scp` on PATH
pub fn check_prerequisites() -> Result<Prerequisites, Xp2pError> {
    let ssh = find_executable(&["ssh", "ssh.exe"]).ok_or_else(|| {
        Xp2pError::ConfigError(
            "ssh client binary not found in PATH (install the OpenSSH client)".to_string(),
        )
    })?;
    let scp = find_executable(&["scp", "scp.exe"]).ok_or_else(|| {
        Xp2pError::ConfigError(
            "scp binary not found in PATH (install the OpenSSH client)".to_string(),
        )
    })?;
    Ok(Prerequisites { ssh, scp })
}

/// First candidate found as a file in any PATH entry
pub fn find_executable(candidates: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| candidates.iter().map(move |name| dir.join(name)))
        .find(|p| p.is_file())
}

/// `ssh`/`scp` backed [`RemoteExec`]
#[derive(Debug, Clone)]
pub struct OpenSsh {
    ssh: PathBuf,
    scp: PathBuf,
}

impl OpenSsh {
    pub fn new(ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>) -> Self {
        Self {
            ssh: ssh.into(),
            scp: scp.into(),
        }
    }
}

impl Default for OpenSsh {
    fn default() -> Self {
        match check_prerequisites() {
            Ok(p) => Self::new(p.ssh, p.scp),
            Err(_) => Self::new("ssh", "scp"),
        }
    }
}

#[async_trait]
impl RemoteExec for OpenSsh {
    async fn check_prerequisites(&self) -> Result<(), Xp2pError> {
        for binary in [&self.ssh, &self.scp] {
            let found = if binary.components().count() > 1 {
                binary.is_file()
            } else {
                find_executable(&[binary.to_string_lossy().as_ref()]).is_some()
            };
            if !found {
                return Err(Xp2pError::ConfigError(format!(
                    "{} not found (install the OpenSSH client)",
                    binary.display()
                )));
            }
        }
        Ok(())
    }

    async fn exec(&self, target: &SshTarget, command: &str) -> Result<ExecOutput, Xp2pError> {
        debug!(target = %target.address(), "ssh exec");
        let output = Command::new(&self.ssh)
            .args(ssh_args(target, command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Xp2pError::RemoteError(format!("run ssh: {e}")))?;

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn copy(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<(), Xp2pError> {
        info!(local = %local.display(), remote, "Uploading over scp");
        let output = Command::new(&self.scp)
            .args(scp_args(target, local, remote))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Xp2pError::RemoteError(format!("run scp: {e}")))?;

        ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .check("scp")
        .map(|_| ())
    }

    async fn forward(
        &self,
        target: &SshTarget,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardGuard, Xp2pError> {
        info!(local_port, remote_port, "Opening SSH port forward");
        let child = Command::new(&self.ssh)
            .args(forward_args(target, local_port, remote_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Xp2pError::RemoteError(format!("spawn ssh forward: {e}")))?;
        Ok(ForwardGuard::new(child))
    }
}

fn common_args(target: &SshTarget, port_flag: &str) -> Vec<String> {
    let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
    if target.port != 0 {
        args.push(port_flag.to_string());
        args.push(target.port.to_string());
    }
    args
}

pub fn ssh_args(target: &SshTarget, command: &str) -> Vec<String> {
    let mut args = common_args(target, "-p");
    args.push(target.address());
    args.push(command.to_string());
    args
}

pub fn scp_args(target: &SshTarget, local: &Path, remote: &str) -> Vec<String> {
    let mut args = common_args(target, "-P");
    args.push(local.to_string_lossy().into_owned());
    args.push(format!("{}:{}", target.address(), remote.replace('\\', "/")));
    args
}

pub fn forward_args(target: &SshTarget, local_port: u16, remote_port: u16) -> Vec<String> {
    let mut args = common_args(target, "-p");
    args.extend([
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-N".to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{local_port}:127.0.0.1:{remote_port}"),
        target.address(),
    ]);
    args
}

/// Quote a value for a POSIX shell
pub fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}
