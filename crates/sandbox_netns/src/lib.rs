//! Network namespace provisioning (`spec.md §4.4`).
//!
//! The control-channel shape — a well-known path the provisioner waits on,
//! then talks a small request/response protocol over — is adapted from the
//! teacher's `container::control::ControlChannel`. Here the path is a Unix
//! domain socket owned by `slirp4netns` (started with `--api-socket`)
//! instead of a FIFO the engine itself creates, since the network helper is
//! an external process with its own control protocol.

mod tool;

pub use tool::SlirpPath;

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(20);
const READY_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// As `spec.md §4.4`'s configuration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Disabled,
    Isolated,
    Outbound,
    OutboundWithHostLoopback,
}

impl NetworkMode {
    pub fn needs_helper(self) -> bool {
        matches!(self, Self::Outbound | Self::OutboundWithHostLoopback)
    }

    pub fn enable_host_loopback(self) -> bool {
        matches!(self, Self::OutboundWithHostLoopback)
    }
}

#[derive(Debug, Error)]
pub enum NetnsError {
    #[error("slirp4netns not found on PATH")]
    ToolNotFound,
    #[error("failed to spawn slirp4netns: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("slirp4netns did not report readiness via {0} in time")]
    ReadyTimeout(PathBuf),
    #[error("control channel request failed: {0}")]
    ControlChannel(#[source] std::io::Error),
    #[error("helper exited before it could be torn down cleanly")]
    HelperDiedEarly,
}

pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
}

/// A running `slirp4netns` instance attached to a sandbox's network
/// namespace (entered via the sandboxed process's PID).
pub struct NetworkHelper {
    child: tokio::process::Child,
    api_socket: PathBuf,
    pid: Pid,
}

/// Starts network provisioning for `mode`, attaching to the network
/// namespace of the process identified by `target_pid` (typically the
/// sandbox helper's PID, so the namespace already exists by the time this
/// is called). Returns `None` for modes that need no helper process.
pub async fn provision(
    mode: NetworkMode,
    target_pid: u32,
    tool: &SlirpPath,
) -> Result<Option<NetworkHelper>, NetnsError> {
    if !mode.needs_helper() {
        return Ok(None);
    }

    if !tool.exists() {
        return Err(NetnsError::ToolNotFound);
    }

    let api_socket = std::env::temp_dir().join(format!("slirp4netns-{target_pid}.sock"));
    let _ = std::fs::remove_file(&api_socket);

    let mut command = tokio::process::Command::new(tool.path());
    command
        .arg("--configure")
        .arg("--api-socket")
        .arg(&api_socket);
    if mode.enable_host_loopback() {
        command.arg("--disable-host-loopback=false");
    } else {
        command.arg("--disable-host-loopback=true");
    }
    command.arg(target_pid.to_string()).arg("tap0");

    let child = command.spawn().map_err(NetnsError::Spawn)?;
    let pid = Pid::from_raw(
        child
            .id()
            .expect("just-spawned child always has a pid") as i32,
    );

    wait_for_ready(&api_socket, pid).await?;

    Ok(Some(NetworkHelper {
        child,
        api_socket,
        pid,
    }))
}

async fn wait_for_ready(api_socket: &std::path::Path, pid: Pid) -> Result<(), NetnsError> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        if signal::kill(pid, None).is_err() {
            return Err(NetnsError::HelperDiedEarly);
        }
        if UnixStream::connect(api_socket).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(NetnsError::ReadyTimeout(api_socket.to_path_buf()));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

#[derive(Serialize)]
struct AddHostFwd {
    execute: &'static str,
    proto: &'static str,
    host_addr: &'static str,
    host_port: u16,
    guest_addr: &'static str,
    guest_port: u16,
}

impl NetworkHelper {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Relays a port-forward request over the running helper's API socket.
    pub async fn request_port_forward(&self, forward: PortForward) -> Result<(), NetnsError> {
        let request = AddHostFwd {
            execute: "add_hostfwd",
            proto: "tcp",
            host_addr: "0.0.0.0",
            host_port: forward.host_port,
            guest_addr: "10.0.2.100",
            guest_port: forward.guest_port,
        };
        let mut stream = UnixStream::connect(&self.api_socket)
            .await
            .map_err(NetnsError::ControlChannel)?;
        let body = serde_json::to_vec(&request).map_err(|e| {
            NetnsError::ControlChannel(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        stream.write_all(&body).await.map_err(NetnsError::ControlChannel)?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(NetnsError::ControlChannel)?;
        Ok(())
    }

    /// Signals the helper to exit, waits briefly, then force-kills it.
    pub async fn shutdown(mut self) -> Result<(), NetnsError> {
        let _ = signal::kill(self.pid, Signal::SIGTERM);

        let exited = tokio::time::timeout(EXIT_GRACE_PERIOD, self.child.wait()).await;
        if exited.is_err() {
            tracing::warn!(pid = %self.pid, "network helper ignored SIGTERM, sending SIGKILL");
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
        let _ = std::fs::remove_file(&self.api_socket);
        Ok(())
    }
}
