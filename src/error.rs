//! Error taxonomy for runs and downloads.
//!
//! Errors raised on the worker thread travel back to the host thread as
//! [`crate::orchestrator::Completion::Failed`], so every variant is `Send`
//! and renders its full message through `Display`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    /// A run was requested while another one is still active.
    #[error("Processing is already running")]
    AlreadyRunning,

    /// Missing or malformed configuration (config file, catalog, file list).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// User-requested cancellation observed at a safe point; carries what was aborted.
    #[error("{0} aborted")]
    Aborted(String),

    /// The external toolkit or a network fetch failed.
    #[error("External tool failed: {0}")]
    ExternalTool(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LauncherError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Cancellation is reported as a distinguished stop, not a crash.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

pub type Result<T, E = LauncherError> = std::result::Result<T, E>;
