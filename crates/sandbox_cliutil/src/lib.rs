//! Conventions common to binaries that host the sandbox engine: process-wide
//! logging setup and a uniform way to turn a top-level `Result` into an exit
//! code with a `FATAL:`-prefixed error message.

mod logging;

pub use logging::{LogGuard, LoggingConfig, LOG_FILE_ENV};

use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{ExitCode, Termination},
};

use anyhow::Result;
use itertools::Itertools;

/// Logs the command line of the current process.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::info!("COMMAND: {}", escaped_command);
}

/// Handles the top-level [`Result`] of a CLI `main`, printing a `FATAL:`
/// message naming the current binary on error.
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("FATAL: {}: {:?}", current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|s| s.to_os_string()))
        .unwrap_or_else(|| OsStr::new("__unknown__").to_os_string())
        .to_string_lossy()
        .into_owned()
}
