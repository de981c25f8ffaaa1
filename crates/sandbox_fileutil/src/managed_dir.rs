use std::path::{Path, PathBuf};

use crate::remove::remove_dir_all_with_chmod;
use crate::SafeTempDir;

/// A directory that is either owned by the engine (and thus removed when
/// released) or provided by the caller (left untouched on release).
///
/// This backs the session workspace's role directories (`spec.md §3`,
/// Session workspace invariant: "Each is either caller-provided ... or
/// engine-allocated").
pub enum ManagedDir {
    Owned(SafeTempDir),
    Borrowed(PathBuf),
}

impl ManagedDir {
    pub fn owned(dir: SafeTempDir) -> Self {
        Self::Owned(dir)
    }

    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self::Borrowed(path.into())
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Owned(dir) => dir.path(),
            Self::Borrowed(path) => path,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    /// Releases the directory: removes it if owned, leaves a borrowed
    /// directory untouched. Unlike `SafeTempDir`'s `Drop` impl, this
    /// surfaces the removal error instead of only logging it, so callers
    /// that need to report teardown failures can.
    pub fn close(self) -> std::io::Result<()> {
        match self {
            Self::Owned(dir) => {
                let path = dir.into_path();
                match remove_dir_all_with_chmod(&path) {
                    Ok(()) => Ok(()),
                    Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err)),
                }
            }
            Self::Borrowed(_) => Ok(()),
        }
    }
}
