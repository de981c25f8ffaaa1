use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use anyhow::Result;
use lazy_static::lazy_static;
use tracing::info_span;

use crate::remove::remove_dir_all_with_chmod;

lazy_static! {
    static ref DEFAULT_PREFIX: OsString = {
        let current_exe = std::env::current_exe().unwrap_or_default();
        let current_program_name = current_exe
            .file_name()
            .unwrap_or(OsStr::new("__unknown__"))
            .to_string_lossy();
        format!("sandbox.{}.", current_program_name).into()
    };
}

/// Safer version of [`tempfile::TempDir`].
///
/// Notable differences:
/// - Directory names are prefixed with the current program name by default,
///   which makes orphaned directories easy to attribute when debugging.
/// - Uses [`remove_dir_all_with_chmod`] so a directory left behind with
///   unusual permissions (by a sandboxed child, for instance) doesn't make
///   teardown fail.
pub struct SafeTempDir {
    dir: Option<PathBuf>,
}

impl SafeTempDir {
    /// Creates a new temporary directory using the default configuration.
    pub fn new() -> Result<Self> {
        SafeTempDirBuilder::new().build()
    }

    /// Takes ownership of an existing directory, deleting it on drop.
    pub fn take(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    /// Returns the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.dir.as_ref().unwrap()
    }

    /// Converts this into a plain [`PathBuf`], transferring cleanup
    /// responsibility to the caller.
    #[must_use]
    pub fn into_path(mut self) -> PathBuf {
        self.dir.take().unwrap()
    }
}

impl Drop for SafeTempDir {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            let _span = info_span!("SafeTempDir::drop", ?dir).entered();
            if let Err(err) = remove_dir_all_with_chmod(dir) {
                tracing::warn!(?dir, %err, "failed to remove temporary directory");
            }
        }
    }
}

pub struct SafeTempDirBuilder<'prefix, 'suffix> {
    builder: tempfile::Builder<'prefix, 'suffix>,
    base_dir: PathBuf,
}

impl<'prefix, 'suffix> SafeTempDirBuilder<'prefix, 'suffix> {
    pub fn new() -> Self {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&*DEFAULT_PREFIX);
        Self {
            builder,
            base_dir: std::env::temp_dir(),
        }
    }

    /// Sets the base directory where the temporary directory is created.
    pub fn base_dir(mut self, dir: &Path) -> Self {
        self.base_dir = dir.to_owned();
        self
    }

    pub fn prefix<S: AsRef<OsStr> + ?Sized>(mut self, prefix: &'prefix S) -> Self {
        self.builder.prefix(prefix);
        self
    }

    pub fn suffix<S: AsRef<OsStr> + ?Sized>(mut self, suffix: &'suffix S) -> Self {
        self.builder.suffix(suffix);
        self
    }

    pub fn build(self) -> Result<SafeTempDir> {
        let dir = self.builder.tempdir_in(&self.base_dir)?;
        Ok(SafeTempDir::take(&dir.into_path()))
    }
}

impl Default for SafeTempDirBuilder<'_, '_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::create_dir, os::unix::fs::PermissionsExt};

    use super::*;

    #[test]
    fn deletes_inaccessible_dirs_on_drop() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let path = temp_dir.path().to_owned();

        let bad_dir = path.join("bad");
        create_dir(&bad_dir)?;
        std::fs::set_permissions(&bad_dir, std::fs::Permissions::from_mode(0o000))?;

        drop(temp_dir);

        assert!(!bad_dir.try_exists()?);
        Ok(())
    }

    #[test]
    fn is_pretty_named() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let name = temp_dir.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("sandbox."), "name = {}", name);
        Ok(())
    }

    #[test]
    fn honors_base_dir() -> Result<()> {
        let parent = SafeTempDir::new()?;
        let child = SafeTempDirBuilder::new().base_dir(parent.path()).build()?;
        assert!(child.path().starts_with(parent.path()));
        Ok(())
    }

    #[test]
    fn honors_custom_prefix_suffix() -> Result<()> {
        let dir = SafeTempDirBuilder::new().prefix("foo.").suffix(".bar").build()?;
        let name = dir.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("foo.") && name.ends_with(".bar"), "name = {}", name);
        Ok(())
    }

    #[test]
    fn take_then_drop_removes_directory() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let path = temp_dir.path().to_owned();

        let path_owned = temp_dir.into_path();
        let retaken = SafeTempDir::take(&path_owned);

        assert!(path.try_exists()?);
        drop(retaken);
        assert!(!path.try_exists()?);
        Ok(())
    }
}
