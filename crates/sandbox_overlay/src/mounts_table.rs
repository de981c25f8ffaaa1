use std::path::Path;

/// Checks whether `target` appears as a mount point in a `/proc/mounts`
/// (or compatible) file. This is the readiness signal for a
/// backgrounding-by-default `fuse-overlayfs` process: there's no ready pipe
/// to read, so we poll the mount table instead, the same observable the
/// teacher's tests use (inverted) to assert a mount point is *not* leaked.
pub async fn is_mounted_at(mounts_file: &Path, target: &Path) -> std::io::Result<bool> {
    let contents = tokio::fs::read_to_string(mounts_file).await?;
    Ok(parse_contains(&contents, target))
}

fn parse_contains(mounts_table: &str, target: &Path) -> bool {
    mounts_table.lines().any(|line| {
        line.split(' ')
            .nth(1)
            .map(|mount_point| Path::new(mount_point) == target)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_matching_mount_point() {
        let table = "fuse-overlayfs /home/user/mnt fuse.fuse-overlayfs rw 0 0\n\
                     tmpfs /tmp tmpfs rw 0 0\n";
        assert!(parse_contains(table, Path::new("/home/user/mnt")));
        assert!(!parse_contains(table, Path::new("/home/user/other")));
    }

    #[test]
    fn empty_table_matches_nothing() {
        assert!(!parse_contains("", Path::new("/mnt")));
    }
}
