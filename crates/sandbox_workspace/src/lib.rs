//! Session workspace allocation (`spec.md §4.2`): the writable directories
//! bind-mounted into a sandbox, each either engine-allocated (removed on
//! release) or caller-provided (left alone).
//!
//! Mirrors the teacher's `container::ContainerSettings`/`PreparedContainer`
//! split between the stage/scratch/root temp directories it allocates with
//! `SafeTempDirBuilder`, generalized to the session/tmp/overlay role set.

use std::path::{Path, PathBuf};

use sandbox_fileutil::{ManagedDir, SafeTempDirBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to allocate {role} workspace directory")]
    Allocate {
        role: Role,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to release one or more workspace directories")]
    Release(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Session,
    Tmp,
    OverlayUpper,
    OverlayWork,
    OverlayMount,
}

/// Per-role directory source: either let the engine allocate a fresh
/// temporary directory under `base_dir`, or bind an existing caller-owned
/// path that the workspace will never delete.
pub enum RoleSource {
    Allocate,
    Caller(PathBuf),
}

/// Which roles this session needs. `Session` and `Tmp` are always present;
/// the three overlay roles are only requested when overlay is active.
pub struct WorkspaceRequest {
    pub session: RoleSource,
    pub tmp: RoleSource,
    pub overlay: Option<OverlayRequest>,
}

pub struct OverlayRequest {
    pub upper: RoleSource,
    pub work: RoleSource,
    pub mount: RoleSource,
}

/// The allocated workspace. `session_dir`/`tmp_dir` are always present;
/// overlay directories are present only if requested.
pub struct Workspace {
    session: ManagedDir,
    tmp: ManagedDir,
    overlay: Option<OverlayDirs>,
}

struct OverlayDirs {
    upper: ManagedDir,
    work: ManagedDir,
    mount: ManagedDir,
}

impl Workspace {
    pub fn allocate(request: WorkspaceRequest, base_dir: &Path) -> Result<Self, WorkspaceError> {
        let session = allocate_role(Role::Session, request.session, base_dir)?;
        let tmp = allocate_role(Role::Tmp, request.tmp, base_dir)?;
        let overlay = match request.overlay {
            Some(overlay) => Some(OverlayDirs {
                upper: allocate_role(Role::OverlayUpper, overlay.upper, base_dir)?,
                work: allocate_role(Role::OverlayWork, overlay.work, base_dir)?,
                mount: allocate_role(Role::OverlayMount, overlay.mount, base_dir)?,
            }),
            None => None,
        };
        Ok(Self {
            session,
            tmp,
            overlay,
        })
    }

    pub fn session_dir(&self) -> &Path {
        self.session.path()
    }

    pub fn tmp_dir(&self) -> &Path {
        self.tmp.path()
    }

    pub fn overlay_upper_dir(&self) -> Option<&Path> {
        self.overlay.as_ref().map(|o| o.upper.path())
    }

    pub fn overlay_work_dir(&self) -> Option<&Path> {
        self.overlay.as_ref().map(|o| o.work.path())
    }

    pub fn overlay_mount_dir(&self) -> Option<&Path> {
        self.overlay.as_ref().map(|o| o.mount.path())
    }

    /// Releases every engine-allocated directory with a best-effort
    /// recursive delete. "Already gone" is not an error; a genuine
    /// permission failure is aggregated and returned after every directory
    /// has been attempted, so one stubborn directory doesn't leak the rest.
    pub fn release(self) -> Result<(), WorkspaceError> {
        let mut dirs = vec![self.session, self.tmp];
        if let Some(overlay) = self.overlay {
            dirs.push(overlay.upper);
            dirs.push(overlay.work);
            dirs.push(overlay.mount);
        }

        let mut first_err = None;
        for dir in dirs {
            if let Err(err) = dir.close() {
                tracing::warn!(%err, "failed to release workspace directory");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(WorkspaceError::Release(err)),
            None => Ok(()),
        }
    }
}

fn allocate_role(role: Role, source: RoleSource, base_dir: &Path) -> Result<ManagedDir, WorkspaceError> {
    match source {
        RoleSource::Caller(path) => Ok(ManagedDir::borrowed(path)),
        RoleSource::Allocate => {
            let prefix = format!("{role}.");
            let dir = SafeTempDirBuilder::new()
                .base_dir(base_dir)
                .prefix(&prefix)
                .build()
                .map_err(|source| WorkspaceError::Allocate { role, source })?;
            Ok(ManagedDir::owned(dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_request(base: &Path) -> WorkspaceRequest {
        let _ = base;
        WorkspaceRequest {
            session: RoleSource::Allocate,
            tmp: RoleSource::Allocate,
            overlay: None,
        }
    }

    #[test]
    fn allocates_session_and_tmp_dirs() {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::allocate(simple_request(base.path()), base.path()).unwrap();
        assert!(ws.session_dir().starts_with(base.path()));
        assert!(ws.tmp_dir().starts_with(base.path()));
        assert_ne!(ws.session_dir(), ws.tmp_dir());
        assert!(ws.overlay_upper_dir().is_none());
    }

    #[test]
    fn allocates_overlay_roles_when_requested() {
        let base = tempfile::tempdir().unwrap();
        let request = WorkspaceRequest {
            session: RoleSource::Allocate,
            tmp: RoleSource::Allocate,
            overlay: Some(OverlayRequest {
                upper: RoleSource::Allocate,
                work: RoleSource::Allocate,
                mount: RoleSource::Allocate,
            }),
        };
        let ws = Workspace::allocate(request, base.path()).unwrap();
        assert!(ws.overlay_upper_dir().unwrap().exists());
        assert!(ws.overlay_work_dir().unwrap().exists());
        assert!(ws.overlay_mount_dir().unwrap().exists());
    }

    #[test]
    fn caller_provided_directory_survives_release() {
        let base = tempfile::tempdir().unwrap();
        let caller_dir = tempfile::tempdir().unwrap();
        let request = WorkspaceRequest {
            session: RoleSource::Caller(caller_dir.path().to_path_buf()),
            tmp: RoleSource::Allocate,
            overlay: None,
        };
        let ws = Workspace::allocate(request, base.path()).unwrap();
        let session_dir = ws.session_dir().to_path_buf();
        ws.release().unwrap();
        assert!(session_dir.exists());
    }

    #[test]
    fn release_removes_engine_allocated_dirs() {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::allocate(simple_request(base.path()), base.path()).unwrap();
        let session_dir = ws.session_dir().to_path_buf();
        let tmp_dir = ws.tmp_dir().to_path_buf();
        ws.release().unwrap();
        assert!(!session_dir.exists());
        assert!(!tmp_dir.exists());
    }
}
