//! Terminal-server configuration and status types

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller-supplied configuration for one interactive terminal server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    /// Unique terminal id
    pub id: String,
    /// Title shown by the GUI
    pub title: String,
    /// Tool this terminal is associated with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Working directory for the shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Environment overrides
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command to run automatically once the terminal is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Shell path; the platform default is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl TerminalConfig {
    /// Build a config with only an id and a title
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            tool_id: None,
            cwd: None,
            env: BTreeMap::new(),
            command: None,
            shell: None,
        }
    }

    /// Name used for port assignments and the pid ledger
    pub fn owner_name(&self) -> String {
        format!("terminal:{}", self.id)
    }
}

/// Status of a terminal instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TerminalStatus {
    /// Terminal server spawned, port not yet bound
    Starting,
    /// Terminal server accepting connections
    Running,
    /// Terminal server being shut down
    Stopping,
    /// Terminal server no longer running
    Stopped,
}

/// Snapshot of one terminal instance
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    /// Terminal id
    pub id: String,
    /// Terminal title
    pub title: String,
    /// Associated tool, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Allocated port
    pub port: u16,
    /// URL the GUI embeds
    pub url: String,
    /// Pid of the terminal-server process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Current status
    pub status: TerminalStatus,
    /// RFC3339 creation timestamp
    pub created_at: String,
    /// Seconds since creation
    pub uptime_secs: u64,
}

/// Fleet-wide terminal summary
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalFleetStatus {
    /// Number of tracked instances
    pub total: usize,
    /// Instances still starting
    pub starting: usize,
    /// Instances running
    pub running: usize,
    /// Instances stopping
    pub stopping: usize,
    /// Instances stopped but not yet closed
    pub stopped: usize,
    /// Per-instance details
    pub instances: Vec<TerminalInfo>,
}

impl TerminalFleetStatus {
    /// Build a summary from instance snapshots
    pub fn from_instances(instances: Vec<TerminalInfo>) -> Self {
        let mut summary = Self {
            total: instances.len(),
            ..Self::default()
        };
        for info in &instances {
            match info.status {
                TerminalStatus::Starting => summary.starting += 1,
                TerminalStatus::Running => summary.running += 1,
                TerminalStatus::Stopping => summary.stopping += 1,
                TerminalStatus::Stopped => summary.stopped += 1,
            }
        }
        summary.instances = instances;
        summary
    }
}
