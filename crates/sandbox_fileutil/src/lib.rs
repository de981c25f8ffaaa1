//! Shared, safer file system primitives used across the sandbox engine
//! crates: temporary directories that clean up reliably, and a small type
//! distinguishing engine-owned directories from caller-provided ones.

mod managed_dir;
mod remove;
mod tempdir;

pub use managed_dir::ManagedDir;
pub use remove::remove_dir_all_with_chmod;
pub use tempdir::{SafeTempDir, SafeTempDirBuilder};
