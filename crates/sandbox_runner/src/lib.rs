//! Assembles and spawns the unprivileged sandbox helper invocation
//! (`spec.md §4.5`).
//!
//! Grounded in two sources: the teacher's `container.rs`
//! (`ContainerSettings`/`PreparedContainer`) for the settings/builder shape,
//! and `other_examples`' `codex-rs` `linux-sandbox/bwrap.rs` for the actual
//! `bwrap` argv construction this crate targets instead of a privileged
//! `pivot_root`/namespace-entry dance.

mod argv;

pub use argv::{build_bwrap_args, build_invocation, sandbox_environment};

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Pipe,
    Pty,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub bwrap_path: PathBuf,
    pub shell: Option<String>,
    pub rootfs: PathBuf,
    pub session_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub resolv_conf: Option<PathBuf>,
    pub env_override: Vec<(String, String)>,
    pub join_netns_pid: Option<u32>,
    pub io_mode: IoMode,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("sandbox helper not found at {0}")]
    ToolNotFound(PathBuf),
    #[error("failed to spawn sandbox helper: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A spawned sandbox child, already placed in its own process group so a
/// group-wide signal reaches every descendant the child's PID namespace
/// might otherwise shield during teardown (`spec.md §9`).
pub struct ProcessRecord {
    pub child: tokio::process::Child,
    pub pgid: Pid,
    pub io_mode: IoMode,
    /// Present only in [`IoMode::Pty`]: the master side of the
    /// pseudoterminal whose slave was wired to the child's stdio.
    pub pty_master: Option<OwnedFd>,
}

/// Spawns `command` (a shell command line, run as `<shell> -c <command>`
/// inside the sandbox) per `settings`.
pub fn spawn(settings: &RunnerSettings, command: &str) -> Result<ProcessRecord, RunnerError> {
    if !tool_exists(&settings.bwrap_path) {
        return Err(RunnerError::ToolNotFound(settings.bwrap_path.clone()));
    }

    let (program, args) = build_invocation(settings, command);

    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&args);
    cmd.env_clear();

    let pty_master = match settings.io_mode {
        IoMode::Pipe => {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        }
        IoMode::Pty => {
            let pty = nix::pty::openpty(None, None)
                .map_err(|e| RunnerError::Spawn(std::io::Error::from(e)))?;
            let stdout_fd = dup_owned(&pty.slave).map_err(RunnerError::Spawn)?;
            let stderr_fd = dup_owned(&pty.slave).map_err(RunnerError::Spawn)?;
            cmd.stdin(Stdio::from(pty.slave));
            cmd.stdout(Stdio::from(stdout_fd));
            cmd.stderr(Stdio::from(stderr_fd));
            Some(pty.master)
        }
    };

    // SAFETY: `setsid` is async-signal-safe and is the only thing done in
    // this pre-exec hook, run in the forked child before exec.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(RunnerError::Spawn)?;
    let pid = child.id().expect("just-spawned child always has a pid");
    let pgid = Pid::from_raw(pid as i32);

    Ok(ProcessRecord {
        child,
        pgid,
        io_mode: settings.io_mode,
        pty_master,
    })
}

/// Sends a signal to the whole process group of a spawned sandbox child.
pub fn signal_group(pgid: Pid, signal: Signal) -> std::io::Result<()> {
    signal::killpg(pgid, signal).map_err(std::io::Error::from)
}

fn dup_owned(fd: &OwnedFd) -> std::io::Result<OwnedFd> {
    let raw = nix::unistd::dup(fd.as_raw_fd()).map_err(std::io::Error::from)?;
    // SAFETY: `dup` just returned a freshly-opened, uniquely-owned fd.
    Ok(unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) })
}

fn tool_exists(path: &std::path::Path) -> bool {
    if path.components().count() > 1 {
        path.exists()
    } else {
        std::env::var_os("PATH")
            .map(|path_var| std::env::split_paths(&path_var).any(|dir| dir.join(path).is_file()))
            .unwrap_or(false)
    }
}
