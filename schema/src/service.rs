//! Service configuration and status types for the portwarden supervisor
//!
//! This module contains the caller-supplied [`ServiceConfig`] and the
//! [`ProcessRecord`] snapshot the supervisor publishes for each registered
//! service.
//!
//! ## Service Lifecycle
//!
//! Services progress through the following states:
//! - `Stopped`: Service is not running
//! - `Starting`: Process spawned, readiness not yet confirmed
//! - `Running`: Readiness confirmed (handshake or port bound)
//! - `Stopping`: Graceful shutdown in progress
//! - `Crashed`: Process exited unexpectedly or failed a health check
//! - `Failed`: Restart ceiling reached, no further automatic restarts

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Complete, immutable configuration for a supervised service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,

    /// What to execute
    pub executable: Executable,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides applied on top of the host environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the child process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Preferred port; when absent the service gets no port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Ports tried in order when the preferred port is occupied
    #[serde(default)]
    pub alternative_ports: Vec<u16>,

    /// Health-check URL, may contain a `{port}` placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,

    /// Interval between health checks in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,

    /// Restart automatically after a crash
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,

    /// Consecutive crashes tolerated before the service is declared failed
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Base delay before an automatic restart, in milliseconds
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl ServiceConfig {
    /// Build a config with defaults for everything but the name and executable
    pub fn new(name: impl Into<String>, executable: Executable) -> Self {
        Self {
            name: name.into(),
            executable,
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            port: None,
            alternative_ports: Vec::new(),
            health_check_url: None,
            health_check_interval_ms: None,
            auto_restart: default_auto_restart(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }

    /// Get the restart delay as a Duration
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Get the health-check interval as a Duration, if configured
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }

    /// Resolve the health-check URL for an allocated port
    ///
    /// Returns `None` when no URL is configured, or when the template needs a
    /// port and none was allocated.
    pub fn resolved_health_check_url(&self, port: Option<u16>) -> Option<String> {
        let template = self.health_check_url.as_deref()?;
        if template.contains("{port}") {
            port.map(|p| template.replace("{port}", &p.to_string()))
        } else {
            Some(template.to_string())
        }
    }

    /// How liveness is determined for this service
    pub fn liveness_mode(&self) -> LivenessMode {
        match (&self.health_check_url, self.health_check_interval_ms) {
            (Some(_), Some(ms)) if ms > 0 => LivenessMode::HealthCheck,
            _ => LivenessMode::ProcessExit,
        }
    }
}

const fn default_auto_restart() -> bool {
    true
}

const fn default_max_restarts() -> u32 {
    5
}

const fn default_restart_delay_ms() -> u64 {
    3000
}

/// Executable reference for a service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Executable {
    /// A script that reports readiness over the stdout handshake channel
    #[serde(rename_all = "camelCase")]
    Script {
        /// Script path
        path: String,
        /// Interpreter used to run the script; the script is executed directly when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<String>,
    },
    /// A native binary with no handshake channel; readiness is port-probed
    #[serde(rename_all = "camelCase")]
    Binary {
        /// Binary path
        path: String,
        /// Fixed delay before port probing begins, for slow starters
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settle_delay_ms: Option<u64>,
    },
}

impl Executable {
    /// Whether this executable speaks the handshake protocol
    pub fn has_handshake(&self) -> bool {
        matches!(self, Executable::Script { .. })
    }

    /// Program and leading arguments to hand to the OS
    pub fn command_line(&self) -> (String, Vec<String>) {
        match self {
            Executable::Script {
                path,
                interpreter: Some(interp),
            } => (interp.clone(), vec![path.clone()]),
            Executable::Script {
                path,
                interpreter: None,
            }
            | Executable::Binary { path, .. } => (path.clone(), Vec::new()),
        }
    }

    /// Settle delay before port probing (binaries only)
    pub fn settle_delay(&self) -> Duration {
        match self {
            Executable::Binary {
                settle_delay_ms: Some(ms),
                ..
            } => Duration::from_millis(*ms),
            _ => Duration::ZERO,
        }
    }
}

/// How a running service is judged alive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LivenessMode {
    /// Periodic health checks; success resets the restart counter
    HealthCheck,
    /// Only process exit signals a problem; the restart counter never resets
    ProcessExit,
}

/// Current status of a supervised service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    /// Service is not running
    Stopped,
    /// Service process is being started
    Starting,
    /// Service is running and ready
    Running,
    /// Service is being gracefully terminated
    Stopping,
    /// Service exited unexpectedly or became unhealthy
    Crashed,
    /// Service exceeded its restart ceiling
    Failed,
}

impl ServiceStatus {
    /// Check if the service has a live process
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Running | ServiceStatus::Stopping
        )
    }

    /// Check if the service is in a terminal error condition
    pub fn is_failed(&self) -> bool {
        matches!(self, ServiceStatus::Failed)
    }
}

/// Status snapshot for one registered service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    /// Service name
    pub name: String,
    /// Current status
    pub status: ServiceStatus,
    /// Pid of the live process, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Allocated port, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Consecutive crashes since the last successful health check
    pub restart_count: u32,
    /// RFC3339 timestamp of the last start attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<String>,
    /// Last error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProcessRecord {
    /// Initial record for a freshly registered service
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Stopped,
            pid: None,
            port: None,
            restart_count: 0,
            last_started_at: None,
            last_error: None,
        }
    }
}
