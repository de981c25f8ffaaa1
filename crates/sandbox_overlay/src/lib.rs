//! Unprivileged overlay filesystem mount/unmount (`spec.md §4.3`).
//!
//! Grounded in the teacher's `container::mounts::mount_overlayfs` for the
//! lower-directory ordering and options-string shape, but retargeted from a
//! privileged kernel `mount(2)` call (via a setuid helper) to spawning
//! `fuse-overlayfs` as an ordinary child process, and from a `Drop`-based
//! [`MountGuard`] to an explicit async `unmount` plus a best-effort
//! synchronous `Drop` fallback, since overlay mount readiness is itself an
//! awaited suspension point here.

mod mounts_table;
mod tools;

pub use tools::ToolPaths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const UNMOUNT_RETRIES: u32 = 5;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("{tool} not found on PATH")]
    ToolNotFound { tool: &'static str },
    #[error("fuse-overlayfs exited with {status}: {stderr}")]
    MountProcessFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("overlay mount at {0} did not become ready in time")]
    MountTimeout(PathBuf),
    #[error("failed to unmount {path} after {attempts} attempts: {source}")]
    UnmountFailed {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct OverlayManager {
    tools: ToolPaths,
}

impl OverlayManager {
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }

    /// Mounts an overlay with `lower` ordered from least to most significant
    /// (matching the teacher's convention, reversed into `lowerdir=` order,
    /// where fuse-overlayfs treats the first entry as the topmost lower
    /// layer).
    pub async fn mount(
        &self,
        lower: &[&Path],
        upper: &Path,
        work: &Path,
        mount_point: &Path,
    ) -> Result<MountHandle, OverlayError> {
        if !tool_exists(&self.tools.fuse_overlayfs) {
            return Err(OverlayError::ToolNotFound {
                tool: "fuse-overlayfs",
            });
        }

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.iter().rev().map(|p| p.display()).join(":"),
            upper.display(),
            work.display(),
        );

        let output = tokio::process::Command::new(&self.tools.fuse_overlayfs)
            .arg("-o")
            .arg(&options)
            .arg(mount_point)
            .output()
            .await?;

        if !output.status.success() {
            return Err(OverlayError::MountProcessFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        self.wait_until_mounted(mount_point).await?;

        Ok(MountHandle {
            mount_point: mount_point.to_path_buf(),
            fusermount: self.tools.fusermount.clone(),
            released: false,
        })
    }

    async fn wait_until_mounted(&self, mount_point: &Path) -> Result<(), OverlayError> {
        let deadline = tokio::time::Instant::now() + MOUNT_READY_TIMEOUT;
        loop {
            if mounts_table::is_mounted_at(Path::new("/proc/mounts"), mount_point).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OverlayError::MountTimeout(mount_point.to_path_buf()));
            }
            tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
        }
    }
}

fn tool_exists(path: &Path) -> bool {
    // A bare command name (no separator) is resolved against `$PATH` by
    // `Command` itself at spawn time; only a path with a separator needs an
    // explicit existence check here.
    if path.components().count() > 1 {
        path.exists()
    } else {
        true
    }
}

/// An active overlay mount. Call [`MountHandle::unmount`] for a result that
/// surfaces failure to the caller, per the unmount contract; dropping
/// without calling it falls back to a best-effort, logged-only unmount
/// (mirrors the teacher's policy of "log, don't panic" on teardown, while
/// still preferring the explicit path whenever the caller can await one).
pub struct MountHandle {
    mount_point: PathBuf,
    fusermount: PathBuf,
    released: bool,
}

impl MountHandle {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub async fn unmount(mut self) -> Result<(), OverlayError> {
        self.released = true;
        unmount_with_retries(&self.fusermount, &self.mount_point).await
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let status = std::process::Command::new(&self.fusermount)
            .arg("-u")
            .arg(&self.mount_point)
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(
                mount_point = %self.mount_point.display(),
                %status,
                "overlay mount leaked: unmount on drop failed"
            ),
            Err(err) => tracing::warn!(
                mount_point = %self.mount_point.display(),
                %err,
                "overlay mount leaked: could not spawn unmount helper on drop"
            ),
        }
    }
}

async fn unmount_with_retries(fusermount: &Path, mount_point: &Path) -> Result<(), OverlayError> {
    let mut last_err = None;
    for attempt in 1..=UNMOUNT_RETRIES {
        let output = tokio::process::Command::new(fusermount)
            .arg("-u")
            .arg(mount_point)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        tracing::warn!(
            mount_point = %mount_point.display(),
            attempt,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "unmount attempt failed"
        );
        last_err = Some(std::io::Error::new(
            std::io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
        tokio::time::sleep(UNMOUNT_RETRY_DELAY).await;
    }
    Err(OverlayError::UnmountFailed {
        path: mount_point.to_path_buf(),
        attempts: UNMOUNT_RETRIES,
        source: last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unmount failed")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowerdir_option_string_orders_most_significant_first() {
        let lower = [Path::new("/a"), Path::new("/b"), Path::new("/c")];
        let joined = lower.iter().rev().map(|p| p.display()).join(":");
        assert_eq!(joined, "/c:/b:/a");
    }

    #[tokio::test]
    async fn unmount_succeeds_against_a_stub_fusermount() {
        let tmp = tempfile::tempdir().unwrap();
        let stub = tmp.path().join("fusermount-stub.sh");
        std::fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&stub, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();

        let result = unmount_with_retries(&stub, tmp.path()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unmount_surfaces_failure_after_retries_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let stub = tmp.path().join("fusermount-stub.sh");
        std::fs::write(&stub, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&stub, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();

        let result = unmount_with_retries(&stub, tmp.path()).await;
        assert!(matches!(result, Err(OverlayError::UnmountFailed { attempts, .. }) if attempts == UNMOUNT_RETRIES));
    }
}
