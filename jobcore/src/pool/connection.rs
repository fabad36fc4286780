//! A single pooled remote connection (spec.md §4.3's connection contract).

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use openssh::{KnownHosts, Session, Stdio};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Host-key verification mode. There is no "disable" variant — spec.md §9
/// eliminates the `known_hosts=None` idiom outright.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// A configured known-hosts file path.
    File(PathBuf),
    /// The platform's default known-hosts file (`~/.ssh/known_hosts`).
    PlatformDefault,
    /// Accept-and-log any host key. Only for clusters explicitly marked
    /// permissive (e.g. ephemeral test clusters); every acceptance is
    /// logged at `warn`.
    PermissiveWarn,
}

impl HostKeyPolicy {
    fn known_hosts_check(&self) -> KnownHosts {
        match self {
            HostKeyPolicy::File(_) | HostKeyPolicy::PlatformDefault => KnownHosts::Strict,
            HostKeyPolicy::PermissiveWarn => KnownHosts::Accept,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

/// The uniform operations available on an open remote connection
/// (spec.md §4.3: "run, file upload, file download, directory listing,
/// connection open/close").
#[async_trait]
pub trait Connection: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> CoreResult<CommandOutput>;
    async fn upload(&self, local: &Path, remote: &str) -> CoreResult<()>;
    async fn download(&self, remote: &str, local: &Path) -> CoreResult<()>;
    async fn list_dir(&self, remote: &str) -> CoreResult<Vec<String>>;
    async fn close(self: Box<Self>) -> CoreResult<()>;
}

pub struct OpenSshConnection {
    session: Session,
}

impl OpenSshConnection {
    pub async fn connect(
        destination: &str,
        policy: &HostKeyPolicy,
        connect_timeout: Duration,
    ) -> CoreResult<Self> {
        if let HostKeyPolicy::PermissiveWarn = policy {
            tracing::warn!(%destination, "connecting with permissive host-key verification");
        }

        let mut builder = openssh::SessionBuilder::default();
        builder
            .known_hosts_check(policy.known_hosts_check())
            .connect_timeout(connect_timeout);
        if let HostKeyPolicy::File(path) = policy {
            builder.user_known_hosts_file(path);
        }

        let session = builder
            .connect(destination)
            .await
            .map_err(|e| map_connect_error(destination, &e))?;
        Ok(Self { session })
    }
}

/// `openssh` reports a host-key mismatch or an unverifiable key as plain
/// text buried in the connect error's `ssh` stderr, not as a distinct
/// error variant. Recognise the standard OpenSSH wording so it surfaces
/// as `HostKeyUnverifiable` rather than being folded into a generic
/// connectivity error (spec.md §7: never silently swallowed).
fn map_connect_error(destination: &str, e: &openssh::Error) -> CoreError {
    if is_host_key_error(e) {
        CoreError::host_key_unverifiable(format!("{destination}: {e}"))
    } else {
        CoreError::connectivity(format!("ssh connect to {destination}: {e}"))
    }
}

fn is_host_key_error(e: &(dyn std::error::Error + 'static)) -> bool {
    const MARKERS: [&str; 4] = [
        "host key verification failed",
        "remote host identification has changed",
        "no matching host key type found",
        "host key for",
    ];
    let msg = e.to_string().to_lowercase();
    if MARKERS.iter().any(|m| msg.contains(m)) {
        return true;
    }
    match std::error::Error::source(e) {
        Some(source) => is_host_key_error(source),
        None => false,
    }
}

#[async_trait]
impl Connection for OpenSshConnection {
    async fn run(&self, command: &str, timeout: Duration) -> CoreResult<CommandOutput> {
        let mut cmd = self.session.raw_command("sh");
        cmd.raw_arg("-c").raw_arg(command);
        let fut = cmd.output();
        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| CoreError::Timeout(timeout))?
            .map_err(|e| CoreError::connectivity(format!("remote command failed: {e}")))?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code(),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> CoreResult<()> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| CoreError::connectivity(format!("read local file {local:?}: {e}")))?;

        let mut cmd = self.session.raw_command("tee");
        cmd.raw_arg(remote).stdin(Stdio::piped()).stdout(Stdio::null());
        let mut child = cmd
            .spawn()
            .await
            .map_err(|e| CoreError::connectivity(format!("spawn upload to {remote}: {e}")))?;
        child
            .stdin()
            .as_mut()
            .expect("stdin piped")
            .write_all(&data)
            .await
            .map_err(|e| CoreError::connectivity(format!("write upload stream: {e}")))?;
        child
            .stdin()
            .take();
        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::connectivity(format!("await upload: {e}")))?;
        if !status.success() {
            return Err(CoreError::connectivity(format!(
                "upload to {remote} exited with {status:?}"
            )));
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> CoreResult<()> {
        let mut cmd = self.session.raw_command("cat");
        cmd.raw_arg(remote).stdout(Stdio::piped());
        let mut child = cmd
            .spawn()
            .await
            .map_err(|e| CoreError::connectivity(format!("spawn download from {remote}: {e}")))?;
        let mut buf = Vec::new();
        child
            .stdout()
            .as_mut()
            .expect("stdout piped")
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CoreError::connectivity(format!("read download stream: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::connectivity(format!("await download: {e}")))?;
        if !status.success() {
            return Err(CoreError::connectivity(format!(
                "download from {remote} exited with {status:?}"
            )));
        }
        tokio::fs::write(local, buf)
            .await
            .map_err(|e| CoreError::connectivity(format!("write local file {local:?}: {e}")))?;
        Ok(())
    }

    async fn list_dir(&self, remote: &str) -> CoreResult<Vec<String>> {
        let output = self.run(&format!("ls -A1 {}", shell_escape::escape(remote.into())), Duration::from_secs(5)).await?;
        if output.exit_code != Some(0) {
            return Err(CoreError::connectivity(format!(
                "list_dir {remote} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.to_string())
            .collect())
    }

    async fn close(self: Box<Self>) -> CoreResult<()> {
        self.session
            .close()
            .await
            .map_err(|e| CoreError::connectivity(format!("close session: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn host_key_mismatch_is_not_swallowed_as_connectivity() {
        let inner = io::Error::other("Host key verification failed.");
        let err = openssh::Error::Connect(inner);
        let mapped = map_connect_error("host.example", &err);
        assert!(matches!(mapped, CoreError::HostKeyUnverifiable(_)));
    }

    #[test]
    fn ordinary_connect_failure_stays_connectivity() {
        let inner = io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused");
        let err = openssh::Error::Connect(inner);
        let mapped = map_connect_error("host.example", &err);
        assert!(matches!(mapped, CoreError::Connectivity(_)));
    }
}
