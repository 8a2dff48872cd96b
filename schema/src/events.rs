//! Event system for the portwarden supervisor
//!
//! This module defines the lifecycle events emitted by the process
//! supervisor and the terminal-server manager. GUI layers subscribe to these
//! to render per-service status, offer manual restarts, and embed terminals.
//!
//! Events are serializable so they can be:
//! - Forwarded verbatim to a GUI over IPC
//! - Logged as structured records
//! - Broadcast to multiple subscribers via event channels

use crate::service::ServiceStatus;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Events emitted by the supervisor and terminal manager
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum HostEvent {
    /// A service start attempt has begun
    #[serde(rename_all = "camelCase")]
    Starting {
        /// Service name
        name: String,
        /// Attempt number: one more than the restart count at the time
        attempt: u32,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service became ready
    #[serde(rename_all = "camelCase")]
    Started {
        /// Service name
        name: String,
        /// Process id
        pid: u32,
        /// Allocated port, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service is being stopped
    #[serde(rename_all = "camelCase")]
    Stopping {
        /// Service name
        name: String,
        /// Whether the stop skips the graceful phase
        force: bool,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service stopped
    #[serde(rename_all = "camelCase")]
    Stopped {
        /// Service name
        name: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service crashed
    #[serde(rename_all = "camelCase")]
    Crashed {
        /// Service name
        name: String,
        /// What went wrong
        reason: String,
        /// Exit code, if the process exited normally
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Terminating signal, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        /// Restart count after this crash
        restart_count: u32,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A health check failed
    #[serde(rename_all = "camelCase")]
    Unhealthy {
        /// Service name
        name: String,
        /// Probe failure description
        reason: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service will not be restarted again automatically
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Service name
        name: String,
        /// Error code of the failure
        code: String,
        /// Failure description
        reason: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// An automatic restart has been scheduled
    #[serde(rename_all = "camelCase")]
    RestartScheduled {
        /// Service name
        name: String,
        /// Attempt number (1-indexed)
        attempt: u32,
        /// Delay before the restart, in milliseconds
        delay_ms: u64,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A successful health check cleared the restart counter
    #[serde(rename_all = "camelCase")]
    RestartCounterReset {
        /// Service name
        name: String,
        /// Counter value before the reset
        previous: u32,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A terminal server is accepting connections
    #[serde(rename = "terminal:ready", rename_all = "camelCase")]
    TerminalReady {
        /// Terminal id
        id: String,
        /// Allocated port
        port: u16,
        /// URL to embed
        url: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The GUI should type a command into a terminal
    #[serde(rename = "terminal:execute", rename_all = "camelCase")]
    TerminalExecute {
        /// Terminal id
        id: String,
        /// Command line to inject
        command: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A terminal was closed
    #[serde(rename = "terminal:closed", rename_all = "camelCase")]
    TerminalClosed {
        /// Terminal id
        id: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A terminal failed to start or exited unexpectedly
    #[serde(rename = "terminal:error", rename_all = "camelCase")]
    TerminalError {
        /// Terminal id
        id: String,
        /// Failure description
        message: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// All terminals were closed during cleanup
    #[serde(rename = "terminal:cleaned", rename_all = "camelCase")]
    TerminalCleaned {
        /// Number of instances that were closed
        closed: usize,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },
}

/// Event severity level for filtering and alerting
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub enum EventSeverity {
    /// Debug information
    Debug,
    /// Informational events
    Info,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
}

impl HostEvent {
    /// Service name or terminal id this event concerns, if any
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Starting { name, .. }
            | Self::Started { name, .. }
            | Self::Stopping { name, .. }
            | Self::Stopped { name, .. }
            | Self::Crashed { name, .. }
            | Self::Unhealthy { name, .. }
            | Self::Failed { name, .. }
            | Self::RestartScheduled { name, .. }
            | Self::RestartCounterReset { name, .. } => Some(name),
            Self::TerminalReady { id, .. }
            | Self::TerminalExecute { id, .. }
            | Self::TerminalClosed { id, .. }
            | Self::TerminalError { id, .. } => Some(id),
            Self::TerminalCleaned { .. } => None,
        }
    }

    /// Get the timestamp for this event
    #[must_use]
    pub fn timestamp(&self) -> &str {
        match self {
            Self::Starting { timestamp, .. }
            | Self::Started { timestamp, .. }
            | Self::Stopping { timestamp, .. }
            | Self::Stopped { timestamp, .. }
            | Self::Crashed { timestamp, .. }
            | Self::Unhealthy { timestamp, .. }
            | Self::Failed { timestamp, .. }
            | Self::RestartScheduled { timestamp, .. }
            | Self::RestartCounterReset { timestamp, .. }
            | Self::TerminalReady { timestamp, .. }
            | Self::TerminalExecute { timestamp, .. }
            | Self::TerminalClosed { timestamp, .. }
            | Self::TerminalError { timestamp, .. }
            | Self::TerminalCleaned { timestamp, .. } => timestamp,
        }
    }

    /// Get the severity level for this event
    #[must_use]
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::Starting { .. }
            | Self::Started { .. }
            | Self::Stopping { .. }
            | Self::Stopped { .. }
            | Self::TerminalReady { .. }
            | Self::TerminalClosed { .. }
            | Self::TerminalCleaned { .. } => EventSeverity::Info,
            Self::RestartCounterReset { .. } | Self::TerminalExecute { .. } => {
                EventSeverity::Debug
            }
            Self::Crashed { .. } | Self::Unhealthy { .. } | Self::RestartScheduled { .. } => {
                EventSeverity::Warning
            }
            Self::Failed { .. } | Self::TerminalError { .. } => EventSeverity::Error,
        }
    }

    /// Service status implied by this event, for status-bar consumers
    #[must_use]
    pub fn implied_status(&self) -> Option<ServiceStatus> {
        match self {
            Self::Starting { .. } => Some(ServiceStatus::Starting),
            Self::Started { .. } => Some(ServiceStatus::Running),
            Self::Stopping { .. } => Some(ServiceStatus::Stopping),
            Self::Stopped { .. } => Some(ServiceStatus::Stopped),
            Self::Crashed { .. } => Some(ServiceStatus::Crashed),
            Self::Failed { .. } => Some(ServiceStatus::Failed),
            _ => None,
        }
    }

    /// Create a current timestamp string in RFC3339 format
    #[must_use]
    pub fn current_timestamp() -> String {
        format!(
            "{}Z",
            humantime::format_rfc3339_seconds(SystemTime::now())
                .to_string()
                .trim_end_matches('Z')
        )
    }

    /// Create a starting event
    #[must_use]
    pub fn starting(name: &str, attempt: u32) -> Self {
        Self::Starting {
            name: name.to_string(),
            attempt,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a started event
    #[must_use]
    pub fn started(name: &str, pid: u32, port: Option<u16>) -> Self {
        Self::Started {
            name: name.to_string(),
            pid,
            port,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a stopping event
    #[must_use]
    pub fn stopping(name: &str, force: bool) -> Self {
        Self::Stopping {
            name: name.to_string(),
            force,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a stopped event
    #[must_use]
    pub fn stopped(name: &str) -> Self {
        Self::Stopped {
            name: name.to_string(),
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a crashed event
    #[must_use]
    pub fn crashed(
        name: &str,
        reason: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        restart_count: u32,
    ) -> Self {
        Self::Crashed {
            name: name.to_string(),
            reason,
            exit_code,
            signal,
            restart_count,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create an unhealthy event
    #[must_use]
    pub fn unhealthy(name: &str, reason: String) -> Self {
        Self::Unhealthy {
            name: name.to_string(),
            reason,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a failed event
    #[must_use]
    pub fn failed(name: &str, code: &str, reason: String) -> Self {
        Self::Failed {
            name: name.to_string(),
            code: code.to_string(),
            reason,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a restart scheduled event
    #[must_use]
    pub fn restart_scheduled(name: &str, attempt: u32, delay_ms: u64) -> Self {
        Self::RestartScheduled {
            name: name.to_string(),
            attempt,
            delay_ms,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a restart counter reset event
    #[must_use]
    pub fn restart_counter_reset(name: &str, previous: u32) -> Self {
        Self::RestartCounterReset {
            name: name.to_string(),
            previous,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a terminal ready event
    #[must_use]
    pub fn terminal_ready(id: &str, port: u16, url: String) -> Self {
        Self::TerminalReady {
            id: id.to_string(),
            port,
            url,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a terminal execute event
    #[must_use]
    pub fn terminal_execute(id: &str, command: String) -> Self {
        Self::TerminalExecute {
            id: id.to_string(),
            command,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a terminal closed event
    #[must_use]
    pub fn terminal_closed(id: &str) -> Self {
        Self::TerminalClosed {
            id: id.to_string(),
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a terminal error event
    #[must_use]
    pub fn terminal_error(id: &str, message: String) -> Self {
        Self::TerminalError {
            id: id.to_string(),
            message,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a terminal cleaned event
    #[must_use]
    pub fn terminal_cleaned(closed: usize) -> Self {
        Self::TerminalCleaned {
            closed,
            timestamp: Self::current_timestamp(),
        }
    }
}
