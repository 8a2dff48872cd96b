//! Host configuration: supervisor and terminal tunables plus the services and
//! terminals to bring up at startup
//!
//! The file is TOML with camelCase keys:
//!
//! ```toml
//! [supervisor]
//! readinessTimeoutMs = 20000
//!
//! [terminal]
//! basePort = 7100
//! toolBinDirs = ["/opt/tools/bin"]
//!
//! [[services]]
//! name = "model-service"
//! executable = { kind = "script", path = "model_service.py", interpreter = "python3" }
//! port = 7200
//! alternativePorts = [7201, 7202]
//! healthCheckUrl = "http://127.0.0.1:{port}/health"
//! healthCheckIntervalMs = 10000
//!
//! [[terminals]]
//! id = "shell"
//! title = "Shell"
//! ```
//!
//! Validation errors carry a field path, e.g.
//! `services[2].name: duplicate name 'api'`.

use crate::{CoreError, Result};
use schema::{Executable, ServiceConfig, TerminalConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for the process supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    /// How long a script gets to print its ready handshake before the port
    /// probe takes over
    pub handshake_timeout_ms: u64,
    /// Overall readiness ceiling for one start attempt
    pub readiness_timeout_ms: u64,
    /// Interval between port readiness probes
    pub readiness_poll_interval_ms: u64,
    /// Grace period between the graceful and the forceful stop signal
    pub stop_grace_period_ms: u64,
    /// Pause between stop and start during a restart
    pub restart_settle_ms: u64,
    /// Timeout for one health-check request
    pub health_check_timeout_ms: u64,
    /// Number of ports scanned above the preferred port
    pub port_scan_width: u16,
    /// Kill whatever holds a service's preferred port before allocating
    pub reclaim_preferred_ports: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            readiness_timeout_ms: 30_000,
            readiness_poll_interval_ms: 250,
            stop_grace_period_ms: 5_000,
            restart_settle_ms: 500,
            health_check_timeout_ms: 5_000,
            port_scan_width: crate::port::DEFAULT_SCAN_WIDTH,
            reclaim_preferred_ports: false,
        }
    }
}

impl SupervisorSettings {
    /// Handshake timeout as a Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Readiness ceiling as a Duration
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Readiness poll interval as a Duration
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    /// Stop grace period as a Duration
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    /// Restart settle delay as a Duration
    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// Health-check request timeout as a Duration
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// How a terminal's startup command reaches the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum CommandDelivery {
    /// Emit `terminal:execute` and let the GUI type the command
    #[default]
    ExecuteEvent,
    /// Run `shell -c "<command>; exec shell -l"` inside the terminal server
    SpawnArgs,
}

/// Tunables for the terminal-server manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalSettings {
    /// First port tried for every terminal
    pub base_port: u16,
    /// Interface the terminal server binds
    pub interface: String,
    /// Number of readiness probes before giving up
    pub readiness_retries: u32,
    /// Interval between readiness probes
    pub readiness_interval_ms: u64,
    /// Delay between `terminal:ready` and `terminal:execute`
    pub command_settle_ms: u64,
    /// Pause between close and re-create during a restart
    pub restart_delay_ms: u64,
    /// Grace period when closing a terminal
    pub close_grace_period_ms: u64,
    /// Forced `COLUMNS`
    pub columns: u16,
    /// Forced `LINES`
    pub lines: u16,
    /// Tool-managed binary directories prepended to `PATH`
    pub tool_bin_dirs: Vec<PathBuf>,
    /// Startup-command delivery mode
    pub command_delivery: CommandDelivery,
    /// Terminal-server binary; `PORTWARDEN_TERMINAL_SERVER` takes precedence
    pub server_binary: Option<String>,
    /// Shell used when a terminal config names none
    pub default_shell: Option<String>,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            base_port: 7100,
            interface: "127.0.0.1".to_string(),
            readiness_retries: 40,
            readiness_interval_ms: 250,
            command_settle_ms: 500,
            restart_delay_ms: 1_000,
            close_grace_period_ms: 3_000,
            columns: 120,
            lines: 40,
            tool_bin_dirs: Vec::new(),
            command_delivery: CommandDelivery::ExecuteEvent,
            server_binary: None,
            default_shell: None,
        }
    }
}

impl TerminalSettings {
    /// Interval between readiness probes as a Duration
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    /// Total readiness ceiling: retries × interval
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_interval()
            .saturating_mul(self.readiness_retries)
    }

    /// Auto-command settle delay as a Duration
    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    /// Restart delay as a Duration
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Close grace period as a Duration
    pub fn close_grace_period(&self) -> Duration {
        Duration::from_millis(self.close_grace_period_ms)
    }
}

/// Complete host configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Supervisor tunables
    pub supervisor: SupervisorSettings,
    /// Terminal tunables
    pub terminal: TerminalSettings,
    /// Services registered and started at boot
    pub services: Vec<ServiceConfig>,
    /// Terminals opened at boot
    pub terminals: Vec<TerminalConfig>,
}

fn invalid(msg: String) -> CoreError {
    CoreError::ValidationError(msg)
}

impl HostConfig {
    /// Validate the configuration with field-path errors
    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;
        if s.readiness_poll_interval_ms == 0 {
            return Err(invalid("supervisor.readinessPollIntervalMs: must be > 0".into()));
        }
        if s.readiness_timeout_ms == 0 {
            return Err(invalid("supervisor.readinessTimeoutMs: must be > 0".into()));
        }

        let t = &self.terminal;
        if t.base_port == 0 {
            return Err(invalid("terminal.basePort: must be 1..=65535".into()));
        }
        if t.readiness_retries == 0 {
            return Err(invalid("terminal.readinessRetries: must be > 0".into()));
        }
        if t.readiness_interval_ms == 0 {
            return Err(invalid("terminal.readinessIntervalMs: must be > 0".into()));
        }
        if t.interface.trim().is_empty() {
            return Err(invalid("terminal.interface: cannot be empty".into()));
        }

        let mut names = HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            validate_service(i, svc)?;
            if !names.insert(svc.name.as_str()) {
                return Err(invalid(format!(
                    "services[{}].name: duplicate name '{}'",
                    i, svc.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for (i, term) in self.terminals.iter().enumerate() {
            if term.id.trim().is_empty() {
                return Err(invalid(format!("terminals[{i}].id: cannot be empty")));
            }
            if term.title.trim().is_empty() {
                return Err(invalid(format!("terminals[{i}].title: cannot be empty")));
            }
            if !ids.insert(term.id.as_str()) {
                return Err(invalid(format!(
                    "terminals[{}].id: duplicate id '{}'",
                    i, term.id
                )));
            }
        }
        Ok(())
    }
}

/// Validate a single service config; `index` is only used in error paths
pub fn validate_service(index: usize, svc: &ServiceConfig) -> Result<()> {
    if svc.name.trim().is_empty() {
        return Err(invalid(format!("services[{index}].name: cannot be empty")));
    }
    let path = match &svc.executable {
        Executable::Script { path, .. } | Executable::Binary { path, .. } => path,
    };
    if path.trim().is_empty() {
        return Err(invalid(format!(
            "services[{index}].executable.path: cannot be empty"
        )));
    }
    if svc.port == Some(0) {
        return Err(invalid(format!("services[{index}].port: must be 1..=65535")));
    }
    if let Some(j) = svc.alternative_ports.iter().position(|p| *p == 0) {
        return Err(invalid(format!(
            "services[{index}].alternativePorts[{j}]: must be 1..=65535"
        )));
    }
    if svc.env.keys().any(|k| k.trim().is_empty()) {
        return Err(invalid(format!("services[{index}].env: keys cannot be empty")));
    }
    if let Some(url) = &svc.health_check_url {
        if url.contains("{port}") && svc.port.is_none() {
            return Err(invalid(format!(
                "services[{index}].healthCheckUrl: uses {{port}} but no port is configured"
            )));
        }
    }
    Ok(())
}

/// Load a host config from a TOML file path
pub fn load_host_config_from_path(path: impl AsRef<Path>) -> Result<HostConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_host_config_from_str(&data)
}

/// Load a host config from a TOML string
pub fn load_host_config_from_str(input: &str) -> Result<HostConfig> {
    let cfg: HostConfig = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
