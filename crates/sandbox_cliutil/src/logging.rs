use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Environment variable naming a file to additionally log to, in case a
/// hosting process wants a durable record of one sandbox session.
pub const LOG_FILE_ENV: &str = "SANDBOX_LOG_FILE";

/// A guard object that keeps the tracing subscriber alive for the process;
/// dropping it flushes any buffered writers.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

/// Configuration for process-wide logging.
///
/// Library crates in this workspace never install a subscriber themselves;
/// only the binary (or test harness) embedding the engine calls
/// [`LoggingConfig::setup`], exactly once.
pub struct LoggingConfig {
    pub log_file: Option<(PathBuf, EnvFilter)>,
    pub console_logger: Option<EnvFilter>,
}

impl LoggingConfig {
    /// Builds a configuration from `RUST_LOG` and [`LOG_FILE_ENV`].
    pub fn from_env() -> Result<Self> {
        let console_logger = Some(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );
        let log_file = std::env::var_os(LOG_FILE_ENV).map(|path| {
            (
                PathBuf::from(path),
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
        });
        Ok(Self {
            log_file,
            console_logger,
        })
    }

    pub fn setup(self) -> Result<LogGuard> {
        let mut layers = Vec::new();

        if let Some(filter) = self.console_logger {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        if let Some((log_file, filter)) = self.log_file {
            let f = std::fs::File::create(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(f)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("Failed to install tracing subscriber; is one already running?")?;

        let span_guard = tracing::trace_span!("main").entered();
        Ok(LogGuard {
            _span_guard: span_guard,
        })
    }
}
