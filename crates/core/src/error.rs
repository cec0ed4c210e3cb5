//! Error taxonomy shared across the watch components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Origin of a runtime error as reported by the component that saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileSystem,
    Translation,
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::FileSystem => "file_system",
            ErrorKind::Translation => "translation",
            ErrorKind::Configuration => "configuration",
        })
    }
}

/// Runtime error flowing through recovery, degradation and feedback
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct WatchError {
    pub kind: ErrorKind,
    pub message: String,
    pub path: Option<PathBuf>,
    pub recoverable: bool,
}

impl WatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            recoverable: true,
        }
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileSystem, message)
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Translation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Wrap an io error observed while touching `path`
    pub fn from_io(err: &std::io::Error, path: &Path) -> Self {
        Self::file_system(err.to_string()).with_path(path)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// Failure loading or validating a watch configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid watch configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

impl From<ConfigError> for WatchError {
    fn from(err: ConfigError) -> Self {
        WatchError::configuration(err.to_string()).unrecoverable()
    }
}

/// Failure persisting or restoring cache contents
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache persistence io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
