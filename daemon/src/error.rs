//! Daemon error types

use portwarden_core::CoreError;
use thiserror::Error;

/// Errors raised while booting or running the host
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to load {path}: {source}")]
    Config { path: String, source: CoreError },

    #[error("Failed to register service '{name}': {source}")]
    Registration { name: String, source: CoreError },

    #[error("Unsupported platform: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Stable code of the underlying core error, if any
    pub fn code(&self) -> Option<&'static str> {
        match self {
            DaemonError::Config { source, .. } | DaemonError::Registration { source, .. } => {
                Some(source.code())
            }
            DaemonError::Core(e) => Some(e.code()),
            DaemonError::Unsupported(_) | DaemonError::Io(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
