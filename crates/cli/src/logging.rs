//! Tracing subscriber setup
//!
//! Filter priority, highest first:
//! 1. `RELOCALE_LOG` (per-target directives, e.g. `relocale_watcher=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `--verbose` (debug) / `--quiet` (error), otherwise info

use anyhow::{Context, Result};
use relocale_core::LogLevel;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
        }
    }

    /// Feedback level implied by the flags, if any
    pub const fn feedback_level(self) -> Option<LogLevel> {
        match self {
            Self::Quiet => Some(LogLevel::Silent),
            Self::Normal => None,
            Self::Verbose => Some(LogLevel::Verbose),
        }
    }
}

/// Install the global subscriber; the guard must outlive the program
pub fn init(verbosity: Verbosity, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = build_env_filter(verbosity);

    let Some(path) = log_file else {
        let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(use_ansi)
                    .with_target(verbosity == Verbosity::Verbose),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Log file path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(Some(guard))
}

fn build_env_filter(verbosity: Verbosity) -> EnvFilter {
    if let Ok(directives) = std::env::var("RELOCALE_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(verbosity.default_level().to_string().to_lowercase())
}
