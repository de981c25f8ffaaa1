use std::path::{Path, PathBuf};

/// Path to the `slirp4netns` binary, overridable for tests/unusual layouts.
#[derive(Debug, Clone)]
pub struct SlirpPath(PathBuf);

impl Default for SlirpPath {
    fn default() -> Self {
        Self("slirp4netns".into())
    }
}

impl SlirpPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn exists(&self) -> bool {
        if self.0.components().count() > 1 {
            self.0.exists()
        } else {
            std::env::var_os("PATH")
                .map(|path_var| {
                    std::env::split_paths(&path_var).any(|dir| dir.join(&self.0).is_file())
                })
                .unwrap_or(false)
        }
    }
}
