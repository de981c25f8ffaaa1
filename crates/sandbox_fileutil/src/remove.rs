use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};

/// Removes a directory tree, tolerating entries whose permissions would
/// otherwise make them unremovable (e.g. a test fixture that chmod'd a
/// directory to `0`).
///
/// [`std::fs::remove_dir_all`] fails outright if it cannot read or write a
/// directory along the way. We first walk the tree granting ourselves
/// read/write/execute on everything, then retry the plain removal.
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => return Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    for entry in walkdir::WalkDir::new(dir).contents_first(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let mode = if entry.file_type().is_dir() { 0o700 } else { 0o600 };
        // Best-effort: if we can't even chmod an entry, remove_dir_all below
        // will surface the real error.
        let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode));
    }

    fs::remove_dir_all(dir)
        .with_context(|| format!("Failed to remove directory {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir, set_permissions, File};

    use super::*;

    #[test]
    fn removes_inaccessible_directory() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let bad_dir = temp.path().join("bad");
        create_dir(&bad_dir)?;
        File::create(bad_dir.join("file"))?;
        set_permissions(&bad_dir, fs::Permissions::from_mode(0o000))?;

        remove_dir_all_with_chmod(&bad_dir)?;
        assert!(!bad_dir.try_exists()?);
        Ok(())
    }

    #[test]
    fn missing_directory_is_not_an_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("missing");
        remove_dir_all_with_chmod(&missing)?;
        Ok(())
    }
}
