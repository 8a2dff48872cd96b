//! Host bootstrap: sweep orphans, wire the supervisor and terminal manager
//!
//! Boot order matters:
//!
//! 1. Pids recorded by a previous run are killed before anything binds a port.
//! 2. The event logger subscribes before the first service starts, so no
//!    lifecycle event is missed.
//! 3. Services start concurrently; a service that fails to start is logged
//!    and left to its own restart policy instead of aborting the boot.
//! 4. Configured terminals open after services.
//!
//! Shutdown runs in the reverse direction: terminals first, then every
//! service, since `shutdown_all` clears every port assignment.

use crate::{DaemonError, Result};
use portwarden_core::config::{load_host_config_from_path, HostConfig};
use portwarden_core::ledger::{OrphanTracker, DEFAULT_SWEEP_GRACE};
use portwarden_core::supervisor::ProcessAdapter;
use portwarden_core::{PortAllocator, ProcessSupervisor, TerminalServerManager};
use schema::HostEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Where the host reads its configuration and keeps its ledger
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// TOML host file; `None` boots an empty host
    pub config_path: Option<PathBuf>,
    /// Pid ledger location; `None` uses `PORTWARDEN_LEDGER` or the temp dir
    pub ledger_path: Option<PathBuf>,
    /// Grace period for killing orphans found at boot
    pub sweep_grace: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            ledger_path: None,
            sweep_grace: DEFAULT_SWEEP_GRACE,
        }
    }
}

/// Load and validate the host file, or return defaults when there is none
pub fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => load_host_config_from_path(path).map_err(|source| DaemonError::Config {
            path: path.display().to_string(),
            source,
        }),
        None => Ok(HostConfig::default()),
    }
}

/// The running host
pub struct Host {
    /// Supervised services
    pub supervisor: Arc<ProcessSupervisor>,
    /// Terminal-server instances
    pub terminals: TerminalServerManager,
    /// Pid ledger shared by both
    pub ledger: Arc<OrphanTracker>,
    event_log: JoinHandle<()>,
}

impl Host {
    /// Subscribe to every lifecycle event
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.supervisor.subscribe()
    }

    /// Log one line per service and terminal
    pub fn log_status(&self) {
        for record in self.supervisor.statuses() {
            info!(
                service = %record.name,
                status = ?record.status,
                pid = ?record.pid,
                port = ?record.port,
                restarts = record.restart_count,
                "service status"
            );
        }
        let summary = self.terminals.status_summary();
        for terminal in &summary.instances {
            info!(
                terminal = %terminal.id,
                status = ?terminal.status,
                url = %terminal.url,
                uptime_secs = terminal.uptime_secs,
                "terminal status"
            );
        }
        info!(
            "{} services, {} of {} terminals running",
            self.supervisor.service_names().len(),
            summary.running,
            summary.total
        );
    }

    /// Close every terminal, stop every service, then stop logging
    pub async fn shutdown(self) {
        info!("Shutting down host");
        let closed = self.terminals.cleanup().await;
        debug!("Closed {} terminals", closed);
        self.supervisor.shutdown_all().await;

        let remaining = self.ledger.snapshot();
        if !remaining.is_empty() {
            warn!("Pid ledger still lists {} pids after shutdown", remaining.iter().count());
        }

        // Let the logger drain the final events
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.event_log.abort();
        info!("Host stopped");
    }
}

/// Boot the host with the platform process adapter
pub async fn bootstrap(options: HostOptions) -> Result<Host> {
    let config = load_config(options.config_path.as_deref())?;
    let ledger = Arc::new(match &options.ledger_path {
        Some(path) => OrphanTracker::open(path),
        None => OrphanTracker::open_default(),
    });
    bootstrap_with(config, ledger, platform_adapter()?, options.sweep_grace).await
}

#[cfg(unix)]
fn platform_adapter() -> Result<Arc<dyn ProcessAdapter>> {
    Ok(Arc::new(portwarden_core::supervisor::UnixProcessAdapter::new()))
}

#[cfg(not(unix))]
fn platform_adapter() -> Result<Arc<dyn ProcessAdapter>> {
    Err(DaemonError::Unsupported(
        "process groups are only implemented for unix".to_string(),
    ))
}

/// Boot the host from an already-loaded config and an explicit adapter
pub async fn bootstrap_with(
    config: HostConfig,
    ledger: Arc<OrphanTracker>,
    adapter: Arc<dyn ProcessAdapter>,
    sweep_grace: Duration,
) -> Result<Host> {
    let report = ledger.cleanup_orphans(sweep_grace).await;
    if !report.killed.is_empty() || !report.already_gone.is_empty() {
        info!(
            "Orphan sweep: {} killed, {} already gone",
            report.killed.len(),
            report.already_gone.len()
        );
    }
    for failure in &report.failures {
        warn!("{}", failure);
    }

    let ports = Arc::new(PortAllocator::with_scan_width(config.supervisor.port_scan_width));
    let supervisor = Arc::new(ProcessSupervisor::new(
        config.supervisor.clone(),
        adapter.clone(),
        ports.clone(),
        ledger.clone(),
    ));
    let event_log = tokio::spawn(log_events(supervisor.subscribe()));
    let terminals = TerminalServerManager::new(
        config.terminal.clone(),
        adapter,
        ports,
        ledger.clone(),
        supervisor.event_sender(),
    );

    for service in config.services {
        let name = service.name.clone();
        supervisor
            .register(service)
            .map_err(|source| DaemonError::Registration { name, source })?;
    }

    let mut starts = JoinSet::new();
    for name in supervisor.service_names() {
        let supervisor = supervisor.clone();
        starts.spawn(async move {
            let result = supervisor.start(&name).await;
            (name, result)
        });
    }
    while let Some(joined) = starts.join_next().await {
        match joined {
            Ok((name, Ok(record))) => {
                info!("Service '{}' ready on port {:?}", name, record.port)
            }
            Ok((name, Err(e))) => error!("Service '{}' failed to start [{}]: {}", name, e.code(), e),
            Err(e) => error!("Service start task failed: {}", e),
        }
    }

    for terminal in config.terminals {
        let id = terminal.id.clone();
        if let Err(e) = terminals.create_terminal(terminal).await {
            error!("Terminal '{}' failed to open [{}]: {}", id, e.code(), e);
        }
    }

    Ok(Host {
        supervisor,
        terminals,
        ledger,
        event_log,
    })
}

/// Log each event as a structured JSON record until the bus closes
async fn log_events(mut rx: broadcast::Receiver<HostEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let json = serde_json::to_string(&event).unwrap_or_else(|e| format!("{event:?} ({e})"));
                match event {
                    HostEvent::Crashed { .. }
                    | HostEvent::Unhealthy { .. }
                    | HostEvent::Failed { .. }
                    | HostEvent::TerminalError { .. } => warn!(event = %json, "host event"),
                    _ => info!(event = %json, "host event"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagged; {} events skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
