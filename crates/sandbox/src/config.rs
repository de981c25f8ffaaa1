use std::path::PathBuf;

use sandbox_netns::NetworkMode;
use sandbox_runner::IoMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("persist_overlay requires an explicit overlay configuration")]
    PersistWithoutOverlay,
}

/// External helper binaries this coordinator shells out to; all
/// overridable so tests and unusual host layouts don't depend on `$PATH`.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub bwrap: PathBuf,
    pub fuse_overlayfs: sandbox_overlay::ToolPaths,
    pub slirp4netns: sandbox_netns::SlirpPath,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            bwrap: "bwrap".into(),
            fuse_overlayfs: sandbox_overlay::ToolPaths::default(),
            slirp4netns: sandbox_netns::SlirpPath::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// `true` leaves the mount live after close; the caller accepts
    /// responsibility for unmounting it.
    pub persist: bool,
    /// Caller-provided overlay directories, if any; `None` lets the
    /// workspace allocate them.
    pub upper_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub mount_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub rootfs_archive: PathBuf,
    pub cache_root: PathBuf,
    pub base_dir: PathBuf,
    pub overlay: Option<OverlayConfig>,
    pub network_mode: NetworkMode,
    pub env_override: Vec<(String, String)>,
    pub shell: Option<String>,
    pub io_mode: IoMode,
    pub tool_paths: ToolPaths,
    /// The interpreter `run_script` invokes on the file it writes, e.g.
    /// `"/bin/sh"` or `"python3"`.
    pub run_command: String,
    /// Extension (without dot) for the file `run_script` writes, e.g. `"sh"`.
    pub run_script_extension: String,
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.overlay {
            Some(overlay) if overlay.persist && overlay.mount_dir.is_none() => {
                Err(ConfigError::PersistWithoutOverlay)
            }
            _ => Ok(()),
        }
    }
}
