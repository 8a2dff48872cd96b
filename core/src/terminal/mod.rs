//! Terminal-server manager
//!
//! Supervises one terminal-server child (ttyd by default) per interactive
//! terminal. Each instance gets a port from the shared [`PortAllocator`], a
//! pid-ledger entry under `terminal:<id>`, and a local URL the GUI embeds.
//!
//! Readiness is a patient port probe: `readinessRetries × readinessInterval`
//! with the child's stderr watched for bind failures, so a broken server
//! fails fast while a slow one is not declared ready prematurely.
//!
//! After readiness the child is handed to a monitor task. The monitor either
//! sees the child exit on its own (the instance is dropped and
//! `terminal:error` is emitted) or receives a close request from
//! [`TerminalServerManager::close_terminal`].

use crate::config::{CommandDelivery, TerminalSettings};
use crate::ledger::OrphanTracker;
use crate::port::PortAllocator;
use crate::process::SpawnRequest;
use crate::supervisor::adapters::{kill_and_reap, stop_gracefully, ManagedProcess, ProcessAdapter};
use crate::supervisor::env::{compose_environment, host_environment};
use crate::supervisor::service_task::read_lines;
use crate::{CoreError, Result};
use dashmap::DashMap;
use schema::{HostEvent, TerminalConfig, TerminalFleetStatus, TerminalInfo, TerminalStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Overrides the terminal-server binary
pub const SERVER_ENV_VAR: &str = "PORTWARDEN_TERMINAL_SERVER";
/// `1` or `true` enables origin checking and credentials
pub const PRODUCTION_ENV_VAR: &str = "PORTWARDEN_PRODUCTION";
/// `user:password` passed to the terminal server in production mode
pub const CREDENTIAL_ENV_VAR: &str = "PORTWARDEN_TERMINAL_CREDENTIAL";
/// Binary looked up on `PATH` when nothing else is configured
pub const DEFAULT_SERVER_BINARY: &str = "ttyd";

/// Terminal-related process environment, read once at construction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalEnvironment {
    /// Value of `PORTWARDEN_TERMINAL_SERVER`
    pub server_override: Option<String>,
    /// Whether `PORTWARDEN_PRODUCTION` is set
    pub production: bool,
    /// Value of `PORTWARDEN_TERMINAL_CREDENTIAL`
    pub credential: Option<String>,
}

impl TerminalEnvironment {
    /// Read the environment of the current process
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            server_override: non_empty(SERVER_ENV_VAR),
            production: non_empty(PRODUCTION_ENV_VAR)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            credential: non_empty(CREDENTIAL_ENV_VAR),
        }
    }
}

/// Whether a terminal-server stderr line reports a fatal bind failure
pub fn is_fatal_stderr(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ["address already in use", "can't bind", "cannot bind", "failed to bind"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Shell for a terminal: its own, the configured default, `$SHELL`, then `/bin/sh`
pub fn resolve_shell(config: &TerminalConfig, settings: &TerminalSettings) -> String {
    config
        .shell
        .clone()
        .or_else(|| settings.default_shell.clone())
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Command line for the terminal server
pub fn server_args(
    config: &TerminalConfig,
    settings: &TerminalSettings,
    env: &TerminalEnvironment,
    port: u16,
    shell: &str,
) -> Vec<String> {
    let mut args = vec![
        "--port".to_string(),
        port.to_string(),
        "--interface".to_string(),
        settings.interface.clone(),
        "--writable".to_string(),
    ];
    if env.production {
        args.push("--check-origin".to_string());
        if let Some(credential) = &env.credential {
            args.push("--credential".to_string());
            args.push(credential.clone());
        }
    }

    args.push(shell.to_string());
    match (&config.command, settings.command_delivery) {
        (Some(command), CommandDelivery::SpawnArgs) => {
            args.push("-c".to_string());
            args.push(format!("{command}; exec {shell} -l"));
        }
        _ => args.push("-l".to_string()),
    }
    args
}

/// Address a local client reaches the server on; wildcards map to loopback
fn reachable_host(interface: &str) -> &str {
    match interface {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    }
}

fn url_for(interface: &str, port: u16) -> String {
    match reachable_host(interface) {
        host if host.contains(':') => format!("http://[{host}]:{port}"),
        host => format!("http://{host}:{port}"),
    }
}

type CloseRequest = oneshot::Sender<()>;

struct TerminalInstance {
    config: TerminalConfig,
    port: u16,
    url: String,
    pid: Option<u32>,
    status: TerminalStatus,
    created_at: String,
    started: Instant,
    close_tx: Option<oneshot::Sender<CloseRequest>>,
}

impl TerminalInstance {
    fn info(&self) -> TerminalInfo {
        TerminalInfo {
            id: self.config.id.clone(),
            title: self.config.title.clone(),
            tool_id: self.config.tool_id.clone(),
            port: self.port,
            url: self.url.clone(),
            pid: self.pid,
            status: self.status,
            created_at: self.created_at.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

struct Inner {
    settings: TerminalSettings,
    environment: TerminalEnvironment,
    adapter: Arc<dyn ProcessAdapter>,
    ports: Arc<PortAllocator>,
    ledger: Arc<OrphanTracker>,
    event_tx: broadcast::Sender<HostEvent>,
    instances: DashMap<String, TerminalInstance>,
}

impl Inner {
    fn emit(&self, event: HostEvent) {
        let _ = self.event_tx.send(event);
    }

    fn forget_pid(&self, pid: u32) {
        if let Err(e) = self.ledger.remove_pid(pid) {
            warn!("Failed to drop pid {} from ledger: {}", pid, e);
        }
    }
}

/// Manager of every live terminal-server instance
#[derive(Clone)]
pub struct TerminalServerManager {
    inner: Arc<Inner>,
}

impl TerminalServerManager {
    /// Create a manager reading [`TerminalEnvironment::from_env`]
    pub fn new(
        settings: TerminalSettings,
        adapter: Arc<dyn ProcessAdapter>,
        ports: Arc<PortAllocator>,
        ledger: Arc<OrphanTracker>,
        event_tx: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self::with_environment(settings, TerminalEnvironment::from_env(), adapter, ports, ledger, event_tx)
    }

    /// Create a manager with an explicit environment
    pub fn with_environment(
        settings: TerminalSettings,
        environment: TerminalEnvironment,
        adapter: Arc<dyn ProcessAdapter>,
        ports: Arc<PortAllocator>,
        ledger: Arc<OrphanTracker>,
        event_tx: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                environment,
                adapter,
                ports,
                ledger,
                event_tx,
                instances: DashMap::new(),
            }),
        }
    }

    /// Subscribe to terminal events
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Terminal-server binary: env override, then config, then `ttyd`
    pub fn server_binary(&self) -> String {
        self.inner
            .environment
            .server_override
            .clone()
            .or_else(|| self.inner.settings.server_binary.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_BINARY.to_string())
    }

    /// Spawn a terminal server and wait until it accepts connections
    pub async fn create_terminal(&self, config: TerminalConfig) -> Result<TerminalInfo> {
        let inner = &self.inner;
        let id = config.id.clone();
        if id.trim().is_empty() {
            return Err(CoreError::ValidationError("terminal id cannot be empty".to_string()));
        }

        match inner.instances.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(CoreError::DuplicateTerminal(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TerminalInstance {
                    config: config.clone(),
                    port: 0,
                    url: String::new(),
                    pid: None,
                    status: TerminalStatus::Starting,
                    created_at: HostEvent::current_timestamp(),
                    started: Instant::now(),
                    close_tx: None,
                });
            }
        }

        let owner = config.owner_name();
        let port = match inner.ports.allocate(&owner, inner.settings.base_port, &[]) {
            Ok(port) => port,
            Err(e) => return Err(self.abort_create(&id, &owner, None, e.to_string())),
        };

        let shell = resolve_shell(&config, &inner.settings);
        let mut env = compose_environment(
            &host_environment(),
            &config.env,
            &inner.settings.tool_bin_dirs,
            &owner,
            Some(port),
        );
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("COLUMNS".to_string(), inner.settings.columns.to_string());
        env.insert("LINES".to_string(), inner.settings.lines.to_string());

        let request = SpawnRequest {
            program: self.server_binary(),
            args: server_args(&config, &inner.settings, &inner.environment, port, &shell),
            env,
            cwd: config.cwd.as_ref().map(PathBuf::from),
        };

        let mut process = match inner.adapter.spawn(&request).await {
            Ok(process) => process,
            Err(e) => return Err(self.abort_create(&id, &owner, None, e.to_string())),
        };
        let pid = process.pid();
        info!("Terminal '{}' spawned as pid {} on port {}", id, pid, port);
        if let Err(e) = inner.ledger.add_pid(pid, &owner) {
            warn!("Failed to record pid {} for terminal '{}': {}", pid, id, e);
        }

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let readers = spawn_output_readers(&id, &mut process, fatal_tx);

        let ready = tokio::select! {
            ready = PortAllocator::wait_for_ready_on(
                reachable_host(&inner.settings.interface),
                port,
                inner.settings.readiness_interval(),
                inner.settings.readiness_timeout(),
            ) => {
                if ready {
                    Ok(())
                } else {
                    Err(format!(
                        "port {} not bound after {} probes",
                        port, inner.settings.readiness_retries
                    ))
                }
            }
            Some(line) = fatal_rx.recv() => Err(format!("terminal server reported: {line}")),
            exit = process.wait() => Err(match exit {
                Ok(exit) => format!("terminal server {exit} before binding port {port}"),
                Err(e) => e.to_string(),
            }),
        };

        if let Err(reason) = ready {
            kill_and_reap(&mut process).await;
            readers.iter().for_each(JoinHandle::abort);
            return Err(self.abort_create(&id, &owner, Some(pid), reason));
        }

        let url = url_for(&inner.settings.interface, port);
        let (close_tx, close_rx) = oneshot::channel();
        let updated = inner.instances.get_mut(&id).map(|mut instance| {
            instance.port = port;
            instance.url = url.clone();
            instance.pid = Some(pid);
            instance.status = TerminalStatus::Running;
            instance.close_tx = Some(close_tx);
            instance.info()
        });
        let info = match updated {
            Some(info) => info,
            None => {
                kill_and_reap(&mut process).await;
                readers.iter().for_each(JoinHandle::abort);
                inner.forget_pid(pid);
                inner.ports.release(&owner);
                return Err(CoreError::TerminalError {
                    id,
                    reason: "closed during startup".to_string(),
                });
            }
        };

        tokio::spawn(monitor(self.inner.clone(), id.clone(), owner, process, close_rx, readers));
        info!("Terminal '{}' ready at {}", id, url);
        inner.emit(HostEvent::terminal_ready(&id, port, url));

        if let (Some(command), CommandDelivery::ExecuteEvent) =
            (config.command.clone(), inner.settings.command_delivery)
        {
            let inner = self.inner.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.settings.command_settle()).await;
                let still_running = inner
                    .instances
                    .get(&id)
                    .is_some_and(|i| i.status == TerminalStatus::Running && i.pid == Some(pid));
                if still_running {
                    debug!("Dispatching startup command to terminal '{}'", id);
                    inner.emit(HostEvent::terminal_execute(&id, command));
                }
            });
        }
        Ok(info)
    }

    /// Roll back a failed create and build its error
    fn abort_create(&self, id: &str, owner: &str, pid: Option<u32>, reason: String) -> CoreError {
        let inner = &self.inner;
        warn!("Terminal '{}' failed to start: {}", id, reason);
        if let Some(pid) = pid {
            inner.forget_pid(pid);
        }
        inner.ports.release(owner);
        inner.instances.remove(id);
        inner.emit(HostEvent::terminal_error(id, reason.clone()));
        CoreError::TerminalError {
            id: id.to_string(),
            reason,
        }
    }

    /// Stop a terminal server and drop it from the active set
    pub async fn close_terminal(&self, id: &str) -> Result<()> {
        let close_tx = {
            let mut instance = self
                .inner
                .instances
                .get_mut(id)
                .ok_or_else(|| CoreError::UnknownTerminal(id.to_string()))?;
            if instance.status == TerminalStatus::Stopping {
                debug!("Terminal '{}' already closing", id);
                return Ok(());
            }
            instance.status = TerminalStatus::Stopping;
            instance.close_tx.take()
        };

        if let Some(close_tx) = close_tx {
            let (done_tx, done_rx) = oneshot::channel();
            if close_tx.send(done_tx).is_ok() {
                let _ = done_rx.await;
            }
        }

        self.inner.instances.remove(id);
        info!("Terminal '{}' closed", id);
        self.inner.emit(HostEvent::terminal_closed(id));
        Ok(())
    }

    /// Close then re-create a terminal from its stored config
    pub async fn restart_terminal(&self, id: &str) -> Result<TerminalInfo> {
        let config = self
            .inner
            .instances
            .get(id)
            .map(|i| i.config.clone())
            .ok_or_else(|| CoreError::UnknownTerminal(id.to_string()))?;
        self.close_terminal(id).await?;
        tokio::time::sleep(self.inner.settings.restart_delay()).await;
        self.create_terminal(config).await
    }

    /// Snapshot of one terminal
    pub fn get(&self, id: &str) -> Option<TerminalInfo> {
        self.inner.instances.get(id).map(|i| i.info())
    }

    /// Terminals associated with a tool
    pub fn by_tool(&self, tool_id: &str) -> Vec<TerminalInfo> {
        self.list()
            .into_iter()
            .filter(|i| i.tool_id.as_deref() == Some(tool_id))
            .collect()
    }

    /// Every active terminal, sorted by id
    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self.inner.instances.iter().map(|i| i.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Counts by status plus per-instance details
    pub fn status_summary(&self) -> TerminalFleetStatus {
        TerminalFleetStatus::from_instances(self.list())
    }

    /// Close every terminal; returns how many were closed
    pub async fn cleanup(&self) -> usize {
        let ids: Vec<String> = self.inner.instances.iter().map(|i| i.key().clone()).collect();
        let mut tasks = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            tasks.spawn(async move { manager.close_terminal(&id).await.is_ok() });
        }

        let mut closed = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                closed += 1;
            }
        }
        info!("Closed {} terminals", closed);
        self.inner.emit(HostEvent::terminal_cleaned(closed));
        closed
    }
}

fn spawn_output_readers(
    id: &str,
    process: &mut Box<dyn ManagedProcess>,
    fatal_tx: mpsc::UnboundedSender<String>,
) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::new();
    if let Some(stdout) = process.take_stdout() {
        let id = id.to_string();
        readers.push(tokio::spawn(read_lines(stdout, move |line| {
            debug!(terminal = %id, "{}", line);
        })));
    }
    if let Some(stderr) = process.take_stderr() {
        let id = id.to_string();
        readers.push(tokio::spawn(read_lines(stderr, move |line| {
            if is_fatal_stderr(&line) {
                warn!(terminal = %id, "{}", line);
                let _ = fatal_tx.send(line);
            } else {
                debug!(terminal = %id, stream = "stderr", "{}", line);
            }
        })));
    }
    readers
}

async fn monitor(
    inner: Arc<Inner>,
    id: String,
    owner: String,
    mut process: Box<dyn ManagedProcess>,
    close_rx: oneshot::Receiver<CloseRequest>,
    readers: Vec<JoinHandle<()>>,
) {
    let pid = process.pid();
    tokio::select! {
        exit = process.wait() => {
            let reason = match exit {
                Ok(exit) => format!("terminal server {exit}"),
                Err(e) => e.to_string(),
            };
            warn!("Terminal '{}' exited unexpectedly: {}", id, reason);
            inner.forget_pid(pid);
            inner.ports.release(&owner);
            inner.instances.remove_if(&id, |_, i| i.pid == Some(pid));
            inner.emit(HostEvent::terminal_error(&id, reason));
        }
        request = close_rx => {
            stop_gracefully(&mut process, inner.settings.close_grace_period()).await;
            inner.forget_pid(pid);
            inner.ports.release(&owner);
            if let Ok(done) = request {
                let _ = done.send(());
            }
        }
    }
    readers.iter().for_each(JoinHandle::abort);
}

#[cfg(test)]
mod tests;
