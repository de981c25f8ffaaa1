//! Content-addressed extraction cache for sandbox rootfs archives
//! (`spec.md §4.1`).
//!
//! `Cache::resolve` hashes an archive, extracts it at most once per host
//! (even across racing processes, via an advisory file lock), and returns
//! the path to the extracted tree. A completion marker file distinguishes a
//! fully-extracted entry from one left behind by a crash mid-extraction.

mod compression;
mod lock;

pub use compression::Compression;

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use crate::lock::LockGuard;

const MARKER_FILE_NAME: &str = "EXTRACTED";
const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read archive {path}: {source}")]
    UnreadableArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown compression format for archive {0}")]
    UnknownCompression(PathBuf),
    #[error("timed out waiting for the cache lock on {0}")]
    LockTimeout(PathBuf),
    #[error("failed to extract archive {archive} into {target}: {source}")]
    ExtractionFailed {
        archive: PathBuf,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A content-addressed rootfs extraction cache rooted at a per-user
/// directory (`spec.md §6`: `<user-cache-root>/rootfs/<hex-hash>/`).
pub struct Cache {
    cache_root: PathBuf,
}

impl Cache {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    /// Resolves an archive to an extracted directory, extracting it on a
    /// cache miss and reusing it on a hit.
    ///
    /// If `target_dir` is given, it is used (and locked) in place of the
    /// default `<cache_root>/rootfs/<hash>` location — useful for tests or
    /// callers that want a private, non-shared extraction.
    #[instrument(skip(self), fields(archive = %archive.display()))]
    pub fn resolve(&self, archive: &Path, target_dir: Option<&Path>) -> Result<PathBuf, CacheError> {
        let hash = hash_file(archive)?;

        let rootfs_dir = self.cache_root.join("rootfs");
        fs::create_dir_all(&rootfs_dir)?;

        let target = match target_dir {
            Some(dir) => dir.to_path_buf(),
            None => rootfs_dir.join(&hash),
        };

        let lock_path = rootfs_dir.join(format!("{hash}.lock"));
        let _lock = LockGuard::acquire(&lock_path)
            .map_err(|_| CacheError::LockTimeout(lock_path.clone()))?;

        let marker = target.join(MARKER_FILE_NAME);
        if marker.try_exists()? {
            tracing::debug!(target = %target.display(), "cache hit");
            return Ok(target);
        }

        tracing::info!(target = %target.display(), "cache miss, extracting");
        if target.try_exists()? {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;

        let compression = Compression::detect(archive).map_err(|_| {
            CacheError::UnknownCompression(archive.to_path_buf())
        })?;

        if let Err(source) = extract(archive, compression, &target) {
            // Don't leave a partial tree behind for a future resolve() to
            // mistake for anything but "needs re-extraction".
            let _ = fs::remove_dir_all(&target);
            return Err(CacheError::ExtractionFailed {
                archive: archive.to_path_buf(),
                target,
                source,
            });
        }

        let marker_file = File::create(&marker)?;
        marker_file.sync_all()?;

        Ok(target)
    }
}

/// Streams the archive file once to compute a stable, collision-resistant
/// digest of its content, independent of its filename (`spec.md §3`).
fn hash_file(path: &Path) -> Result<String, CacheError> {
    let file = File::open(path).map_err(|source| CacheError::UnreadableArchive {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn extract(archive: &Path, compression: Compression, out_dir: &Path) -> std::io::Result<()> {
    let file = File::open(archive)?;
    let decompressed: Box<dyn Read> = match compression {
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Compression::None => Box::new(file),
    };
    tar::Archive::new(decompressed).unpack(out_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar_gz(path: &Path, file_name: &str, content: &[u8]) {
        let f = File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, file_name, content).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn resolves_and_reuses_on_second_call() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("rootfs.tar.gz");
        write_tar_gz(&archive, "hello.txt", b"hello, sandbox");

        let cache = Cache::new(tmp.path().join("cache"));
        let first = cache.resolve(&archive, None).unwrap();
        assert_eq!(
            std::fs::read_to_string(first.join("hello.txt")).unwrap(),
            "hello, sandbox"
        );

        let second = cache.resolve(&archive, None).unwrap();
        assert_eq!(first, second);
        assert!(second.join(MARKER_FILE_NAME).try_exists().unwrap());
    }

    #[test]
    fn identity_is_independent_of_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.tar.gz");
        let b = tmp.path().join("b.tar.gz");
        write_tar_gz(&a, "x.txt", b"same bytes");
        std::fs::copy(&a, &b).unwrap();

        let cache = Cache::new(tmp.path().join("cache"));
        assert_eq!(cache.resolve(&a, None).unwrap(), cache.resolve(&b, None).unwrap());
    }

    #[test]
    fn unreadable_archive_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path().join("cache"));
        let result = cache.resolve(&tmp.path().join("does-not-exist.tar"), None);
        assert!(matches!(result, Err(CacheError::UnreadableArchive { .. })));
    }

    #[test]
    fn removes_partial_extraction_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("broken.tar.gz");
        std::fs::write(&archive, b"\x1f\x8bnot actually gzip").unwrap();

        let cache = Cache::new(tmp.path().join("cache"));
        let result = cache.resolve(&archive, None);
        assert!(result.is_err());

        // The extraction directory must not be left behind half-populated.
        let rootfs_dir = tmp.path().join("cache").join("rootfs");
        let leftover = std::fs::read_dir(&rootfs_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().ends_with(".lock"))
            .count();
        assert_eq!(leftover, 0);
    }
}
