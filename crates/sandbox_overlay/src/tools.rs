use std::path::{Path, PathBuf};

/// Names of the external FUSE helpers this crate shells out to, overridable
/// so tests and unusual host layouts don't depend on `$PATH` search order.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub fuse_overlayfs: PathBuf,
    pub fusermount: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            fuse_overlayfs: "fuse-overlayfs".into(),
            fusermount: default_fusermount(),
        }
    }
}

/// Prefers `fusermount3` (util-linux / modern fuse3 installs) and falls back
/// to `fusermount` when it isn't on `PATH`.
fn default_fusermount() -> PathBuf {
    for name in ["fusermount3", "fusermount"] {
        if which(name).is_some() {
            return PathBuf::from(name);
        }
    }
    PathBuf::from("fusermount3")
}

fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
