//! SSH tunnel to a remote Docker daemon.
//!
//! Forwards a local unix socket to the remote daemon socket with
//! `ssh -L`, so the regular Docker client can talk to the remote host. The
//! ssh process is killed and the socket directory removed when the tunnel is
//! dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::plan::Action;

/// Remote daemon socket path.
pub const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// A running `ssh -L` forward.
#[derive(Debug)]
pub struct SshTunnel {
    destination: String,
    socket: PathBuf,
    child: Child,
    _dir: TempDir,
}

impl SshTunnel {
    /// Opens a tunnel with the default timeout.
    pub async fn open(user: Option<&str>, host: &str, port: Option<u16>) -> Result<Self> {
        Self::open_with_timeout(user, host, port, DEFAULT_OPEN_TIMEOUT).await
    }

    /// Opens a tunnel, waiting up to `timeout` for the local socket.
    ///
    /// # Errors
    ///
    /// Returns a transport error if ssh cannot be spawned, exits early, or
    /// does not create the socket in time.
    pub async fn open_with_timeout(
        user: Option<&str>,
        host: &str,
        port: Option<u16>,
        timeout: Duration,
    ) -> Result<Self> {
        let destination = match user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        let transport_err =
            |reason: String| OrchestratorError::transport(&destination, Action::Connect, reason);

        let dir = tempfile::Builder::new()
            .prefix("bosun-ssh-")
            .tempdir()
            .map_err(|e| transport_err(format!("failed to create socket directory: {e}")))?;
        let socket = dir.path().join("docker.sock");

        info!(destination = %destination, socket = %socket.display(), "Opening SSH tunnel");

        let mut child = Command::new("ssh")
            .args(ssh_args(&destination, port, &socket, REMOTE_DOCKER_SOCKET))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| transport_err(format!("failed to spawn ssh: {e}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if socket.exists() {
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                let stderr = read_stderr(&mut child).await;
                return Err(transport_err(format!("ssh exited with {status}: {stderr}")));
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(transport_err(format!(
                    "tunnel socket did not appear within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        debug!(destination = %destination, "SSH tunnel ready");
        Ok(Self {
            destination,
            socket,
            child,
            _dir: dir,
        })
    }

    /// Returns the local socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        debug!(destination = %self.destination, "Closing SSH tunnel");
        let _ = self.child.start_kill();
    }
}

async fn read_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;

    let mut output = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut output).await;
    }
    output.trim().to_string()
}

/// Builds the ssh argument list for forwarding `local` to `remote`.
fn ssh_args(destination: &str, port: Option<u16>, local: &Path, remote: &str) -> Vec<String> {
    let mut args = vec![
        "-nNT".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StreamLocalBindUnlink=yes".to_string(),
        "-L".to_string(),
        format!("{}:{}", local.display(), remote),
    ];
    if let Some(port) = port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    args.push("--".to_string());
    args.push(destination.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let args = ssh_args(
            "deploy@build.example.com",
            Some(2222),
            Path::new("/tmp/bosun-ssh-x/docker.sock"),
            REMOTE_DOCKER_SOCKET,
        );

        assert_eq!(args.first().map(String::as_str), Some("-nNT"));
        assert!(args.contains(&"/tmp/bosun-ssh-x/docker.sock:/var/run/docker.sock".to_string()));
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
        assert_eq!(args.last().map(String::as_str), Some("deploy@build.example.com"));
    }

    #[test]
    fn test_ssh_args_end_options_before_destination() {
        let args = ssh_args("builder", None, Path::new("/tmp/s.sock"), REMOTE_DOCKER_SOCKET);
        assert_eq!(&args[args.len() - 2..], ["--", "builder"]);
    }

    #[test]
    fn test_ssh_args_without_port() {
        let args = ssh_args("builder", None, Path::new("/tmp/s.sock"), REMOTE_DOCKER_SOCKET);
        assert!(!args.contains(&"-p".to_string()));
    }
}
