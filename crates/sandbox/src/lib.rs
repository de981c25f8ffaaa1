//! Sandbox coordinator (`spec.md §4.7`): scoped acquisition over the
//! archive cache, session workspace, overlay manager, network provisioner,
//! and sandbox runner, with guaranteed, ordered teardown.
//!
//! The state machine and rollback-on-init-failure shape follow the
//! teacher's `PreparedContainer`/`ContainerCommand` split (settings
//! captured up front, a single fallible construction step, teardown driven
//! by field order / explicit release rather than ambient `Drop` magic for
//! anything that can fail and needs to report it).

mod config;

pub use config::{ConfigError, OverlayConfig, SandboxConfig, ToolPaths};

use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::Pid;
use sandbox_netns::NetworkMode;
use sandbox_process::Supervisor;
use sandbox_runner::{IoMode, RunnerSettings};
use sandbox_workspace::{OverlayRequest, RoleSource, Workspace, WorkspaceRequest};
use thiserror::Error;

/// Grace period between `SIGTERM` and `SIGKILL` when tearing down a live
/// process group in `close()`, matching `sandbox_process`'s own
/// `TERM_GRACE_PERIOD`.
const TERM_GRACE_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to resolve rootfs archive: {0}")]
    Archive(#[from] archive_cache::CacheError),
    #[error("failed to allocate session workspace: {0}")]
    Workspace(#[from] sandbox_workspace::WorkspaceError),
    #[error("failed to mount overlay: {0}")]
    Overlay(#[from] sandbox_overlay::OverlayError),
    #[error("failed to provision network: {0}")]
    Network(#[from] sandbox_netns::NetnsError),
    #[error("failed to spawn sandboxed process: {0}")]
    Runner(#[from] sandbox_runner::RunnerError),
    #[error("sandbox is not open (state: {0:?})")]
    NotOpen(State),
    #[error("{} teardown step(s) failed: {}", .0.len(), .0.join("; "))]
    Teardown(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Constructed,
    Open,
    Closing,
    Closed,
}

pub struct Sandbox {
    config: SandboxConfig,
    state: State,
    workspace: Option<Workspace>,
    rootfs_dir: Option<PathBuf>,
    overlay_mount: Option<sandbox_overlay::MountHandle>,
    network_helper: Option<sandbox_netns::NetworkHelper>,
    /// PID of the first sandboxed process once networking has been
    /// provisioned against it; later `run()` calls join this same network
    /// namespace via `nsenter` instead of each getting their own, since
    /// `slirp4netns` is configured against a single namespace per `Sandbox`.
    netns_target_pid: Option<u32>,
    live_pgids: Vec<Pid>,
}

impl Sandbox {
    /// Captures configuration without touching the host. Call
    /// [`Sandbox::open`] to actually enter the scoped region.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            config,
            state: State::Constructed,
            workspace: None,
            rootfs_dir: None,
            overlay_mount: None,
            network_helper: None,
            netns_target_pid: None,
            live_pgids: Vec::new(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Resolves the archive, allocates the workspace, mounts the overlay if
    /// requested, configures networking, and transitions to `Open`. Any
    /// failure rolls back everything already done, in reverse order, and
    /// transitions to `Closed`.
    pub async fn open(&mut self) -> Result<(), SandboxError> {
        match self.open_inner().await {
            Ok(()) => {
                self.state = State::Open;
                Ok(())
            }
            Err(err) => {
                self.rollback().await;
                self.state = State::Closed;
                Err(err)
            }
        }
    }

    async fn open_inner(&mut self) -> Result<(), SandboxError> {
        let cache = archive_cache::Cache::new(self.config.cache_root.clone());
        let archive = self.config.rootfs_archive.clone();
        let rootfs_dir = tokio::task::spawn_blocking(move || cache.resolve(&archive, None))
            .await
            .expect("archive resolution task panicked")?;
        self.rootfs_dir = Some(rootfs_dir);

        let overlay_request = self.config.overlay.as_ref().map(|overlay| OverlayRequest {
            upper: role_source(&overlay.upper_dir),
            work: role_source(&overlay.work_dir),
            mount: role_source(&overlay.mount_dir),
        });
        let workspace = Workspace::allocate(
            WorkspaceRequest {
                session: RoleSource::Allocate,
                tmp: RoleSource::Allocate,
                overlay: overlay_request,
            },
            &self.config.base_dir,
        )?;

        if let Some(overlay_config) = &self.config.overlay {
            let manager = sandbox_overlay::OverlayManager::new(self.config.tool_paths.fuse_overlayfs.clone());
            let rootfs_dir = self.rootfs_dir.clone().expect("set above");
            let handle = manager
                .mount(
                    &[rootfs_dir.as_path()],
                    workspace.overlay_upper_dir().expect("requested above"),
                    workspace.overlay_work_dir().expect("requested above"),
                    workspace.overlay_mount_dir().expect("requested above"),
                )
                .await;
            match handle {
                Ok(handle) => self.overlay_mount = Some(handle),
                Err(err) => {
                    self.workspace = Some(workspace);
                    return Err(err.into());
                }
            }
            let _ = overlay_config;
        }
        self.workspace = Some(workspace);

        if self.config.network_mode.needs_helper() && !self.config.tool_paths.slirp4netns.exists() {
            // `slirp4netns` itself only runs once a sandboxed process
            // exists to attach to (see `run`), but a missing binary should
            // fail fast at `open()` rather than surprise the caller on the
            // first `run()`.
            return Err(sandbox_netns::NetnsError::ToolNotFound.into());
        }

        Ok(())
    }

    /// Spawns `command` (a shell command line) inside the sandbox. Requires
    /// `Open`. The first call that needs networking provisions
    /// `slirp4netns` against the freshly spawned process's own network
    /// namespace; later calls join that same namespace via `nsenter`
    /// (`spec.md §4.4`: one network identity per open sandbox).
    pub async fn run(&mut self, command: &str) -> Result<Supervisor, SandboxError> {
        if self.state != State::Open {
            return Err(SandboxError::NotOpen(self.state));
        }
        let workspace = self.workspace.as_ref().expect("open() populates this");

        let rootfs = self
            .overlay_mount
            .as_ref()
            .map(|m| m.mount_point().to_path_buf())
            .unwrap_or_else(|| self.rootfs_dir.clone().expect("open() populates this"));

        let settings = RunnerSettings {
            bwrap_path: self.config.tool_paths.bwrap.clone(),
            shell: self.config.shell.clone(),
            rootfs,
            session_dir: workspace.session_dir().to_path_buf(),
            tmp_dir: workspace.tmp_dir().to_path_buf(),
            resolv_conf: resolv_conf_for(self.config.network_mode),
            env_override: self.config.env_override.clone(),
            join_netns_pid: self.netns_target_pid,
            io_mode: self.config.io_mode,
        };

        let record = sandbox_runner::spawn(&settings, command)?;
        let pid = record.pgid;
        self.live_pgids.push(pid);

        if self.netns_target_pid.is_none() && self.config.network_mode.needs_helper() {
            let helper = sandbox_netns::provision(
                self.config.network_mode,
                pid.as_raw() as u32,
                &self.config.tool_paths.slirp4netns,
            )
            .await?;
            self.network_helper = helper;
            self.netns_target_pid = Some(pid.as_raw() as u32);
        }

        Supervisor::new(record)
            .map_err(sandbox_runner::RunnerError::Spawn)
            .map_err(SandboxError::from)
    }

    /// Serializes `code` to a file inside the session directory with the
    /// configured extension, then delegates to [`Sandbox::run`] with
    /// `<run_command> <file_path>`.
    pub async fn run_script(&mut self, code: &str) -> Result<Supervisor, SandboxError> {
        if self.state != State::Open {
            return Err(SandboxError::NotOpen(self.state));
        }
        let workspace = self.workspace.as_ref().expect("open() populates this");
        let file_name = format!("script.{}", self.config.run_script_extension);
        let script_path = workspace.session_dir().join(&file_name);
        std::fs::write(&script_path, code)
            .map_err(|e| SandboxError::Runner(sandbox_runner::RunnerError::Spawn(e)))?;

        let sandboxed_path = PathBuf::from("/home/sandbox").join(&file_name);
        let command = format!(
            "{} {}",
            self.config.run_command,
            shell_escape::escape(sandboxed_path.to_string_lossy())
        );
        self.run(&command).await
    }

    /// Terminates all live process records, tears down networking, unmounts
    /// the overlay (unless persisted), releases engine-allocated
    /// directories, and transitions to `Closed`. Idempotent.
    pub async fn close(&mut self) -> Result<(), SandboxError> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closing;

        let mut errors: Vec<String> = Vec::new();
        let mut note = |context: &str, err: &dyn std::fmt::Display| {
            tracing::warn!(%context, %err, "teardown step failed");
            errors.push(format!("{context}: {err}"));
        };

        let pgids: Vec<Pid> = self.live_pgids.drain(..).collect();
        for pgid in &pgids {
            if let Err(err) = sandbox_runner::signal_group(*pgid, nix::sys::signal::Signal::SIGTERM) {
                note("terminate child process group", &err);
            }
        }
        if !pgids.is_empty() {
            tokio::time::sleep(TERM_GRACE_PERIOD).await;
            // No Child handle at this layer, so there's no `wait()` to race
            // against the grace period; sent unconditionally, ignoring
            // ESRCH from a group that already exited on its own.
            for pgid in &pgids {
                let _ = sandbox_runner::signal_group(*pgid, nix::sys::signal::Signal::SIGKILL);
            }
        }

        if let Some(helper) = self.network_helper.take() {
            if let Err(err) = helper.shutdown().await {
                note("network helper shutdown", &err);
            }
        }

        let persist = self
            .config
            .overlay
            .as_ref()
            .map(|o| o.persist)
            .unwrap_or(false);
        if let Some(mount) = self.overlay_mount.take() {
            if persist {
                std::mem::forget(mount);
            } else if let Err(err) = mount.unmount().await {
                note("overlay unmount", &err);
            }
        }

        if let Some(workspace) = self.workspace.take() {
            if let Err(err) = workspace.release() {
                note("workspace release", &err);
            }
        }

        self.state = State::Closed;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Teardown(errors))
        }
    }

    async fn rollback(&mut self) {
        if let Some(helper) = self.network_helper.take() {
            let _ = helper.shutdown().await;
        }
        if let Some(mount) = self.overlay_mount.take() {
            let _ = mount.unmount().await;
        }
        if let Some(workspace) = self.workspace.take() {
            if let Err(err) = workspace.release() {
                tracing::warn!(%err, "failed to release workspace during rollback");
            }
        }
    }
}

impl Drop for Sandbox {
    /// `close()` does real async teardown (network helper shutdown, overlay
    /// unmount, directory release) that a destructor cannot await. This is
    /// a best-effort backstop for a caller that forgot to call it: it signals
    /// any still-tracked process groups so they don't outlive the sandbox,
    /// and logs loudly rather than silently leaking the mount/workspace.
    fn drop(&mut self) {
        if self.state == State::Closed {
            return;
        }
        tracing::warn!(
            "Sandbox dropped without calling close(); signaling tracked processes, \
             but the overlay mount and workspace directories may leak"
        );
        for pgid in &self.live_pgids {
            let _ = sandbox_runner::signal_group(*pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

/// Runs `body` against an opened sandbox and guarantees [`Sandbox::close`]
/// is awaited afterward, success or failure, since `Drop` cannot `.await`
/// the real teardown path.
pub async fn open_scoped<F, Fut, T>(config: SandboxConfig, body: F) -> Result<T, SandboxError>
where
    F: FnOnce(&mut Sandbox) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let mut sandbox = Sandbox::new(config)?;
    sandbox.open().await?;
    let result = body(&mut sandbox).await;
    sandbox.close().await?;
    Ok(result)
}

fn role_source(path: &Option<PathBuf>) -> RoleSource {
    match path {
        Some(path) => RoleSource::Caller(path.clone()),
        None => RoleSource::Allocate,
    }
}

fn resolv_conf_for(mode: NetworkMode) -> Option<PathBuf> {
    match mode {
        NetworkMode::Disabled | NetworkMode::Outbound | NetworkMode::OutboundWithHostLoopback => {
            Some(PathBuf::from("/etc/resolv.conf"))
        }
        NetworkMode::Isolated => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(base: &std::path::Path) -> SandboxConfig {
        SandboxConfig {
            rootfs_archive: base.join("rootfs.tar"),
            cache_root: base.join("cache"),
            base_dir: base.to_path_buf(),
            overlay: None,
            network_mode: NetworkMode::Isolated,
            env_override: vec![],
            shell: None,
            io_mode: IoMode::Pipe,
            tool_paths: ToolPaths::default(),
            run_command: "/bin/sh".to_string(),
            run_script_extension: "sh".to_string(),
        }
    }

    #[test]
    fn rejects_persist_without_explicit_mount_dir() {
        let base = tempfile::tempdir().unwrap();
        let mut config = base_config(base.path());
        config.overlay = Some(OverlayConfig {
            persist: true,
            upper_dir: None,
            work_dir: None,
            mount_dir: None,
        });
        let result = Sandbox::new(config);
        assert!(matches!(result, Err(SandboxError::Config(ConfigError::PersistWithoutOverlay))));
    }

    #[test]
    fn starts_in_constructed_state() {
        let base = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(base_config(base.path())).unwrap();
        assert_eq!(sandbox.state(), State::Constructed);
    }

    #[tokio::test]
    async fn run_before_open_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::new(base_config(base.path())).unwrap();
        let result = sandbox.run("true").await;
        assert!(matches!(result, Err(SandboxError::NotOpen(State::Constructed))));
    }

    #[tokio::test]
    async fn close_before_open_is_a_harmless_noop() {
        let base = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::new(base_config(base.path())).unwrap();
        sandbox.state = State::Closed;
        assert!(sandbox.close().await.is_ok());
    }

    #[tokio::test]
    async fn open_fails_fast_on_missing_archive() {
        let base = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::new(base_config(base.path())).unwrap();
        let result = sandbox.open().await;
        assert!(matches!(result, Err(SandboxError::Archive(_))));
        assert_eq!(sandbox.state(), State::Closed);
    }

    #[tokio::test]
    async fn open_scoped_propagates_open_failure() {
        let base = tempfile::tempdir().unwrap();
        let result = open_scoped(base_config(base.path()), |_sandbox| async { 42 }).await;
        assert!(matches!(result, Err(SandboxError::Archive(_))));
    }
}
