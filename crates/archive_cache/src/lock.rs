use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Holds an advisory exclusive lock on a sibling `.lock` file for the
/// lifetime of one cache resolution, so two processes racing to extract the
/// same archive serialize instead of corrupting each other's output
/// (`spec.md §5`: archive extraction is a cache-entry-scoped critical
/// section).
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    pub fn acquire(lock_path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, "failed to release cache lock");
        }
    }
}
