//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("No free port for '{service}': tried {preferred}, {alternatives} alternatives and a scan of {scanned}")]
    PortExhaustion {
        service: String,
        preferred: u16,
        alternatives: usize,
        scanned: u16,
    },

    #[error("Failed to spawn '{name}': {reason}")]
    SpawnFailure { name: String, reason: String },

    #[error("'{name}' did not become ready within {timeout_ms}ms")]
    ReadinessTimeout { name: String, timeout_ms: u64 },

    #[error("'{name}' crashed: {reason}")]
    RuntimeCrash { name: String, reason: String },

    #[error("Health check for '{name}' failed: {reason}")]
    HealthCheckFailure { name: String, reason: String },

    #[error("'{name}' exceeded its restart ceiling of {max_restarts}")]
    RestartCeilingExceeded { name: String, max_restarts: u32 },

    #[error("Could not kill orphan pid {pid} ('{name}'): {reason}")]
    OrphanSweepFailure { name: String, pid: u32, reason: String },

    #[error("Service '{0}' is already registered")]
    DuplicateService(String),

    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Terminal '{0}' already exists")]
    DuplicateTerminal(String),

    #[error("Unknown terminal '{0}'")]
    UnknownTerminal(String),

    #[error("Terminal '{id}' failed: {reason}")]
    TerminalError { id: String, reason: String },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Start of '{name}' was interrupted by a stop request")]
    StartInterrupted { name: String },

    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::PortExhaustion { .. } => "PW001",
            CoreError::SpawnFailure { .. } => "PW002",
            CoreError::ReadinessTimeout { .. } => "PW003",
            CoreError::RuntimeCrash { .. } => "PW004",
            CoreError::HealthCheckFailure { .. } => "PW005",
            CoreError::RestartCeilingExceeded { .. } => "PW006",
            CoreError::OrphanSweepFailure { .. } => "PW007",
            CoreError::DuplicateService(_) => "PW010",
            CoreError::UnknownService(_) => "PW011",
            CoreError::DuplicateTerminal(_) => "PW012",
            CoreError::UnknownTerminal(_) => "PW013",
            CoreError::TerminalError { .. } => "PW014",
            CoreError::ShuttingDown => "PW015",
            CoreError::StartInterrupted { .. } => "PW016",
            CoreError::ProcessSignal(_) => "PW020",
            CoreError::ProcessWait(_) => "PW021",
            CoreError::ConfigurationError(_) => "PW030",
            CoreError::ValidationError(_) => "PW031",
            CoreError::InitializationError(_) => "PW032",
            CoreError::IoError(_) => "PW040",
            CoreError::SerializationError(_) => "PW041",
            CoreError::Other(_) => "PW999",
        }
    }

    /// Whether this failure should go through the crash/restart path
    ///
    /// Spawn failures, readiness timeouts, crashes and failed health checks
    /// are restartable; port exhaustion and bookkeeping errors are not.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            CoreError::SpawnFailure { .. }
                | CoreError::ReadinessTimeout { .. }
                | CoreError::RuntimeCrash { .. }
                | CoreError::HealthCheckFailure { .. }
        )
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}
