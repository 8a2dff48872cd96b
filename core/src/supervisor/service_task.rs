//! Service supervisor task implementation
//!
//! This module contains the [`ServiceSupervisor`], the per-service actor that
//! owns one service's state machine:
//!
//! ```text
//! stopped → starting → running → stopping → stopped
//!              │          │
//!              └──────────┴──→ crashed ──→ starting (after backoff)
//!                                 └──────→ failed (ceiling reached)
//! ```
//!
//! Control messages are handled one at a time, so start/stop/restart for a
//! service are serialized. Process exits, handshake messages and timers are
//! multiplexed into the same loop.
//!
//! A start in progress keeps listening for control messages while it waits
//! for readiness. A stop or shutdown cuts it short; a start or restart is
//! queued until the start has settled.

use super::adapters::{kill_and_reap, stop_gracefully, ManagedProcess, OutputStream, ProcessAdapter};
use super::env::{compose_environment, host_environment};
use super::restart_policy::{RestartAction, RestartTracker};
use super::ControlMsg;
use crate::config::SupervisorSettings;
use crate::health;
use crate::ledger::OrphanTracker;
use crate::port::PortAllocator;
use crate::process::{ProcessExit, SpawnRequest};
use crate::{CoreError, Result};
use schema::{HandshakeMessage, HostEvent, LivenessMode, ProcessRecord, ServiceConfig, ServiceStatus};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shared collaborators handed to every service actor
#[derive(Clone)]
pub struct SupervisorContext {
    /// Supervisor tunables
    pub settings: SupervisorSettings,
    /// Spawns children
    pub adapter: Arc<dyn ProcessAdapter>,
    /// Shared port table
    pub ports: Arc<PortAllocator>,
    /// Durable pid ledger
    pub ledger: Arc<OrphanTracker>,
    /// Lifecycle event bus
    pub event_tx: broadcast::Sender<HostEvent>,
}

/// Per-service actor
pub struct ServiceSupervisor {
    config: ServiceConfig,
    ctx: SupervisorContext,
    record_tx: watch::Sender<ProcessRecord>,
    record: ProcessRecord,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    /// Start/restart requests received while a start was in flight
    deferred: VecDeque<ControlMsg>,
    process: Option<Box<dyn ManagedProcess>>,
    handshake_rx: Option<mpsc::UnboundedReceiver<HandshakeMessage>>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    restarts: RestartTracker,
    restart_at: Option<Instant>,
    health_at: Option<Instant>,
    /// Set by a `shutdown` handshake; the next exit is not a crash
    expect_exit: bool,
    /// Set once a shutdown request has been served
    exiting: bool,
}

/// How a readiness wait ended, short of an error
enum Readiness {
    Ready,
    /// A stop or shutdown arrived first
    Interrupted(ControlMsg),
}

impl ServiceSupervisor {
    /// Create a new service supervisor
    pub fn new(
        config: ServiceConfig,
        ctx: SupervisorContext,
        record_tx: watch::Sender<ProcessRecord>,
        control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    ) -> Self {
        let restarts = RestartTracker::new(config.max_restarts, config.restart_delay());
        let record = ProcessRecord::stopped(config.name.clone());
        Self {
            config,
            ctx,
            record_tx,
            record,
            control_rx,
            deferred: VecDeque::new(),
            process: None,
            handshake_rx: None,
            stdout_task: None,
            stderr_task: None,
            restarts,
            restart_at: None,
            health_at: None,
            expect_exit: false,
            exiting: false,
        }
    }

    /// Run the supervisor task loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        debug!("Supervisor for '{}' running", self.config.name);
        // Timers are checked on every wakeup; the tick bounds their latency
        let mut tick = interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.exiting {
            if let Some(msg) = self.deferred.pop_front() {
                self.handle_control_message(msg).await;
                continue;
            }

            tokio::select! {
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_control_message(msg).await,
                        None => {
                            debug!("Control channel for '{}' closed", self.config.name);
                            break;
                        }
                    }
                }

                exit = wait_exit(&mut self.process), if self.process.is_some() => {
                    self.handle_process_exit(exit).await;
                }

                msg = next_handshake(&mut self.handshake_rx), if self.handshake_rx.is_some() => {
                    self.handle_handshake(msg);
                }

                _ = tick.tick() => {}
            }

            if !self.exiting {
                self.handle_timers().await;
            }
        }

        if self.process.is_some() {
            self.stop_service(false).await;
        }
        debug!("Supervisor for '{}' terminated", self.config.name);
    }

    async fn handle_control_message(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Start { reply } => {
                let result = self.start_service().await;
                let _ = reply.send(result);
            }
            ControlMsg::Stop { force, reply } => {
                let record = self.stop_service(force).await;
                let _ = reply.send(Ok(record));
            }
            ControlMsg::Restart { reply } => {
                info!("Restarting service '{}'", self.config.name);
                self.stop_service(false).await;
                sleep(self.ctx.settings.restart_settle()).await;
                let result = self.start_service().await;
                let _ = reply.send(result);
            }
            ControlMsg::Shutdown { reply } => {
                self.stop_service(false).await;
                self.exiting = true;
                let _ = reply.send(());
            }
        }
    }

    async fn start_service(&mut self) -> Result<ProcessRecord> {
        if matches!(self.record.status, ServiceStatus::Running | ServiceStatus::Starting) {
            debug!("Service '{}' already {:?}", self.config.name, self.record.status);
            return Ok(self.record.clone());
        }
        self.restart_at = None;
        self.launch().await
    }

    /// One start attempt: allocate, spawn, wait for readiness
    async fn launch(&mut self) -> Result<ProcessRecord> {
        let name = self.config.name.clone();
        self.emit(HostEvent::starting(&name, self.restarts.count() + 1));
        self.record.status = ServiceStatus::Starting;
        self.record.last_error = None;
        self.publish();

        let port = match self.allocate_port().await {
            Ok(port) => port,
            Err(e) => {
                error!("Cannot start '{}': {}", name, e);
                self.record.status = ServiceStatus::Stopped;
                self.record.last_error = Some(e.to_string());
                self.publish();
                self.emit(HostEvent::failed(&name, e.code(), e.to_string()));
                return Err(e);
            }
        };

        let request = self.spawn_request(port);
        let mut process = match self.ctx.adapter.spawn(&request).await {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to spawn '{}': {}", name, e);
                self.ctx.ports.release(&name);
                return Err(self.fail_start(e, None));
            }
        };

        let pid = process.pid();
        info!("Spawned '{}' as pid {} (port {:?})", name, pid, port);
        if let Err(e) = self.ctx.ledger.add_pid(pid, &name) {
            warn!("Failed to record pid {} for '{}': {}", pid, name, e);
        }
        self.spawn_output_readers(&mut *process);
        self.record.pid = Some(pid);
        self.record.port = port;
        self.publish();
        self.process = Some(process);

        match self.await_readiness(port).await {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Interrupted(msg)) => return Err(self.abandon_start(msg).await),
            Err(e) => {
                warn!("Service '{}' failed to become ready: {}", name, e);
                let exit = match self.process.as_mut() {
                    Some(process) => kill_and_reap(process).await,
                    None => None,
                };
                self.process = None;
                self.release_resources(Some(pid));
                // A child that refused to start is a failed start; one that
                // never got ready is an ordinary crash
                if matches!(e, CoreError::SpawnFailure { .. }) {
                    return Err(self.fail_start(e, exit));
                }
                self.on_crash(&e, exit, false);
                return Err(e);
            }
        }

        self.record.status = ServiceStatus::Running;
        self.record.last_started_at = Some(HostEvent::current_timestamp());
        self.publish();
        self.emit(HostEvent::started(&name, pid, port));
        info!("Service '{}' is running", name);

        if self.config.liveness_mode() == LivenessMode::HealthCheck {
            self.health_at = self.config.health_check_interval().map(|i| Instant::now() + i);
        }
        Ok(self.record.clone())
    }

    async fn allocate_port(&self) -> Result<Option<u16>> {
        let Some(preferred) = self.config.port else {
            return Ok(None);
        };
        let name = &self.config.name;
        let ports = &self.ctx.ports;
        if self.ctx.settings.reclaim_preferred_ports
            && !ports.assignments().values().any(|p| *p == preferred)
            && !PortAllocator::is_available(preferred)
        {
            let killed =
                PortAllocator::kill_occupant(preferred, self.ctx.settings.stop_grace_period()).await;
            if !killed.is_empty() {
                info!("Reclaimed port {} for '{}' from pids {:?}", preferred, name, killed);
            }
        }
        ports
            .allocate(name, preferred, &self.config.alternative_ports)
            .map(Some)
    }

    fn spawn_request(&self, port: Option<u16>) -> SpawnRequest {
        let (program, mut args) = self.config.executable.command_line();
        args.extend(self.config.args.iter().cloned());
        let env = compose_environment(
            &host_environment(),
            &self.config.env,
            &[],
            &self.config.name,
            port,
        );
        SpawnRequest {
            program,
            args,
            env,
            cwd: self.config.cwd.as_ref().map(PathBuf::from),
        }
    }

    /// Wait for the handshake or the port, racing the child's own exit
    async fn await_readiness(&mut self, port: Option<u16>) -> Result<Readiness> {
        let name = self.config.name.clone();
        let settings = &self.ctx.settings;
        let deadline = Instant::now() + settings.readiness_timeout();
        let Some(process) = self.process.as_mut() else {
            return Err(CoreError::ProcessWait(format!("'{name}' has no process")));
        };

        if self.config.executable.has_handshake() {
            let handshake_deadline =
                Instant::now() + settings.handshake_timeout().min(settings.readiness_timeout());
            loop {
                tokio::select! {
                    exit = process.wait() => return Err(exited_during_startup(&name, exit)),
                    msg = next_handshake(&mut self.handshake_rx), if self.handshake_rx.is_some() => {
                        match msg {
                            Some(HandshakeMessage::Ready) => {
                                debug!("'{}' sent ready handshake", name);
                                return Ok(Readiness::Ready);
                            }
                            Some(HandshakeMessage::Error { reason }) => {
                                return Err(CoreError::SpawnFailure { name, reason });
                            }
                            Some(HandshakeMessage::Shutdown) => self.expect_exit = true,
                            None => self.handshake_rx = None,
                        }
                    }
                    Some(msg) = self.control_rx.recv() => {
                        if let Some(msg) = defer_unless_stop(msg, &mut self.deferred) {
                            return Ok(Readiness::Interrupted(msg));
                        }
                    }
                    _ = sleep_until(handshake_deadline) => break,
                }
            }
            if port.is_none() {
                return Err(CoreError::ReadinessTimeout {
                    name,
                    timeout_ms: settings.handshake_timeout_ms.min(settings.readiness_timeout_ms),
                });
            }
            debug!("No handshake from '{}', falling back to port probe", name);
        } else {
            let settle = self.config.executable.settle_delay();
            if !settle.is_zero() {
                let settled = sleep(settle);
                tokio::pin!(settled);
                loop {
                    tokio::select! {
                        exit = process.wait() => return Err(exited_during_startup(&name, exit)),
                        Some(msg) = self.control_rx.recv() => {
                            if let Some(msg) = defer_unless_stop(msg, &mut self.deferred) {
                                return Ok(Readiness::Interrupted(msg));
                            }
                        }
                        _ = &mut settled => break,
                    }
                }
            }
        }

        let Some(port) = port else {
            return Ok(Readiness::Ready);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ready = PortAllocator::wait_for_ready_every(port, settings.readiness_poll_interval(), remaining);
        tokio::pin!(ready);
        loop {
            tokio::select! {
                exit = process.wait() => return Err(exited_during_startup(&name, exit)),
                ready = &mut ready => {
                    return if ready {
                        Ok(Readiness::Ready)
                    } else {
                        Err(CoreError::ReadinessTimeout {
                            name,
                            timeout_ms: settings.readiness_timeout_ms,
                        })
                    };
                }
                Some(msg) = self.control_rx.recv() => {
                    if let Some(msg) = defer_unless_stop(msg, &mut self.deferred) {
                        return Ok(Readiness::Interrupted(msg));
                    }
                }
            }
        }
    }

    /// Drop an in-flight start in favour of a stop or shutdown request
    ///
    /// No crash is recorded: the child is stopped like a running one, and
    /// requests queued behind the start are answered with the interruption.
    async fn abandon_start(&mut self, msg: ControlMsg) -> CoreError {
        let name = self.config.name.clone();
        info!("Start of '{}' interrupted before it became ready", name);
        for queued in std::mem::take(&mut self.deferred) {
            match queued {
                ControlMsg::Start { reply } | ControlMsg::Restart { reply } => {
                    let _ = reply.send(Err(CoreError::StartInterrupted { name: name.clone() }));
                }
                other => self.deferred.push_back(other),
            }
        }

        match msg {
            ControlMsg::Stop { force, reply } => {
                let record = self.stop_service(force).await;
                let _ = reply.send(Ok(record));
            }
            ControlMsg::Shutdown { reply } => {
                self.stop_service(false).await;
                self.exiting = true;
                let _ = reply.send(());
            }
            other => {
                self.stop_service(false).await;
                self.deferred.push_back(other);
            }
        }
        CoreError::StartInterrupted { name }
    }

    /// Report a failed start and run it through the crash path
    fn fail_start(&mut self, cause: CoreError, exit: Option<ProcessExit>) -> CoreError {
        self.emit(HostEvent::failed(&self.config.name, cause.code(), cause.to_string()));
        self.on_crash(&cause, exit, true);
        cause
    }

    async fn stop_service(&mut self, force: bool) -> ProcessRecord {
        let name = self.config.name.clone();
        self.restart_at = None;
        self.health_at = None;

        let Some(mut process) = self.process.take() else {
            if self.record.status != ServiceStatus::Stopped {
                self.record.status = ServiceStatus::Stopped;
                self.publish();
                self.emit(HostEvent::stopped(&name));
            }
            return self.record.clone();
        };

        info!("Stopping service '{}'{}", name, if force { " (forced)" } else { "" });
        self.record.status = ServiceStatus::Stopping;
        self.publish();
        self.emit(HostEvent::stopping(&name, force));

        let pid = process.pid();
        let exit = if force {
            kill_and_reap(&mut process).await
        } else {
            stop_gracefully(&mut process, self.ctx.settings.stop_grace_period()).await
        };
        match exit {
            Some(exit) => debug!("Service '{}' {}", name, exit),
            None => warn!("Could not confirm exit of pid {} for '{}'", pid, name),
        }

        self.release_resources(Some(pid));
        self.expect_exit = false;
        self.record.status = ServiceStatus::Stopped;
        self.publish();
        self.emit(HostEvent::stopped(&name));
        self.record.clone()
    }

    async fn handle_process_exit(&mut self, exit: Result<ProcessExit>) {
        let name = self.config.name.clone();
        let pid = self.process.take().map(|p| p.pid());
        self.release_resources(pid);

        if std::mem::take(&mut self.expect_exit) {
            info!("Service '{}' exited after announcing shutdown", name);
            self.record.status = ServiceStatus::Stopped;
            self.publish();
            self.emit(HostEvent::stopped(&name));
            return;
        }

        let (reason, exit) = match exit {
            Ok(exit) => (exit.to_string(), Some(exit)),
            Err(e) => (e.to_string(), None),
        };
        warn!("Service '{}' {}", name, reason);
        let cause = CoreError::RuntimeCrash { name, reason };
        self.on_crash(&cause, exit, false);
    }

    fn handle_handshake(&mut self, msg: Option<HandshakeMessage>) {
        match msg {
            Some(HandshakeMessage::Shutdown) => {
                info!("Service '{}' announced shutdown", self.config.name);
                self.expect_exit = true;
            }
            Some(HandshakeMessage::Error { reason }) => {
                warn!("Service '{}' reported error: {}", self.config.name, reason);
                self.record.last_error = Some(reason);
                self.publish();
            }
            Some(HandshakeMessage::Ready) => {}
            None => self.handshake_rx = None,
        }
    }

    /// Crash accounting: schedule a restart while under the ceiling, else give up
    ///
    /// `reported` is set when a `failed` event for the cause was already sent.
    fn on_crash(&mut self, cause: &CoreError, exit: Option<ProcessExit>, reported: bool) {
        let name = self.config.name.clone();
        let action = self.config.auto_restart.then(|| self.restarts.record_crash());
        let count = self.restarts.count();

        self.health_at = None;
        self.record.status = ServiceStatus::Crashed;
        self.record.restart_count = count;
        self.record.pid = None;
        self.record.port = None;
        self.record.last_error = Some(cause.to_string());
        self.publish();
        self.emit(HostEvent::crashed(
            &name,
            cause.to_string(),
            exit.and_then(|e| e.exit_code),
            exit.and_then(|e| e.signal),
            count,
        ));

        let Some(action) = action else {
            info!("Service '{}' crashed and auto-restart is disabled", name);
            self.record.status = ServiceStatus::Failed;
            self.publish();
            if !reported {
                self.emit(HostEvent::failed(&name, cause.code(), cause.to_string()));
            }
            return;
        };

        match action {
            RestartAction::Restart { attempt, delay } => {
                info!("Restarting '{}' in {:?} (attempt {})", name, delay, attempt);
                self.restart_at = Some(Instant::now() + delay);
                self.emit(HostEvent::restart_scheduled(&name, attempt, delay.as_millis() as u64));
            }
            RestartAction::GiveUp { restarts } => {
                let ceiling = CoreError::RestartCeilingExceeded {
                    name: name.clone(),
                    max_restarts: self.config.max_restarts,
                };
                error!("{} after {} restarts", ceiling, restarts);
                self.record.status = ServiceStatus::Failed;
                self.record.last_error = Some(ceiling.to_string());
                self.publish();
                self.emit(HostEvent::failed(&name, ceiling.code(), ceiling.to_string()));
            }
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.restart_at.is_some_and(|at| at <= now) {
            self.restart_at = None;
            if let Err(e) = self.launch().await {
                debug!("Scheduled restart of '{}' failed: {}", self.config.name, e);
            }
        }

        if self.health_at.is_some_and(|at| at <= now) && self.record.status == ServiceStatus::Running {
            self.run_health_check().await;
        }
    }

    async fn run_health_check(&mut self) {
        let name = self.config.name.clone();
        let Some(url) = self.config.resolved_health_check_url(self.record.port) else {
            self.health_at = None;
            return;
        };

        match health::check_url(&url, self.ctx.settings.health_check_timeout()).await {
            Ok(()) => {
                debug!("Health check for '{}' passed", name);
                if self.restarts.count() > 0 {
                    let previous = self.restarts.reset();
                    info!("Service '{}' healthy again, restart counter reset from {}", name, previous);
                    self.record.restart_count = 0;
                    self.publish();
                    self.emit(HostEvent::restart_counter_reset(&name, previous));
                }
                self.health_at = self.config.health_check_interval().map(|i| Instant::now() + i);
            }
            Err(e) => {
                warn!("Health check for '{}' failed: {}", name, e);
                self.health_at = None;
                self.emit(HostEvent::unhealthy(&name, e.to_string()));

                let mut exit = None;
                let mut pid = None;
                if let Some(mut process) = self.process.take() {
                    pid = Some(process.pid());
                    exit = kill_and_reap(&mut process).await;
                }
                self.release_resources(pid);
                let cause = CoreError::HealthCheckFailure {
                    name,
                    reason: e.to_string(),
                };
                self.on_crash(&cause, exit, false);
            }
        }
    }

    /// Drop everything tied to the current process: readers, timers, ledger entry, port
    fn release_resources(&mut self, pid: Option<u32>) {
        if let Some(handle) = self.stdout_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_task.take() {
            handle.abort();
        }
        self.handshake_rx = None;
        self.health_at = None;

        if let Some(pid) = pid {
            if let Err(e) = self.ctx.ledger.remove_pid(pid) {
                warn!("Failed to drop pid {} from ledger: {}", pid, e);
            }
        }
        if let Some(port) = self.ctx.ports.release(&self.config.name) {
            debug!("Released port {} of '{}'", port, self.config.name);
        }
        self.record.pid = None;
        self.record.port = None;
    }

    /// Forward child output to tracing; stdout is also scanned for handshake lines
    fn spawn_output_readers(&mut self, process: &mut dyn ManagedProcess) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handshake_rx = Some(rx);

        if let Some(stdout) = process.take_stdout() {
            let name = self.config.name.clone();
            self.stdout_task = Some(tokio::spawn(read_lines(stdout, move |line| {
                match HandshakeMessage::parse_line(&line) {
                    Some(msg) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!(service = %name, "{}", line),
                }
            })));
        }
        if let Some(stderr) = process.take_stderr() {
            let name = self.config.name.clone();
            self.stderr_task = Some(tokio::spawn(read_lines(stderr, move |line| {
                debug!(service = %name, stream = "stderr", "{}", line);
            })));
        }
    }

    fn publish(&self) {
        self.record_tx.send_replace(self.record.clone());
    }

    fn emit(&self, event: HostEvent) {
        // No subscribers is fine
        let _ = self.ctx.event_tx.send(event);
    }
}

/// Read `reader` line by line until EOF or error
pub(crate) async fn read_lines<F>(reader: OutputStream, mut on_line: F)
where
    F: FnMut(String) + Send,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(line),
            Ok(None) => break,
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                break;
            }
        }
    }
}

async fn wait_exit(process: &mut Option<Box<dyn ManagedProcess>>) -> Result<ProcessExit> {
    match process {
        Some(process) => process.wait().await,
        None => std::future::pending().await,
    }
}

async fn next_handshake(
    rx: &mut Option<mpsc::UnboundedReceiver<HandshakeMessage>>,
) -> Option<HandshakeMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Stop and shutdown pass through; anything else waits for the start to settle
fn defer_unless_stop(msg: ControlMsg, deferred: &mut VecDeque<ControlMsg>) -> Option<ControlMsg> {
    match msg {
        ControlMsg::Stop { .. } | ControlMsg::Shutdown { .. } => Some(msg),
        msg => {
            deferred.push_back(msg);
            None
        }
    }
}

fn exited_during_startup(name: &str, exit: Result<ProcessExit>) -> CoreError {
    match exit {
        Ok(exit) => CoreError::RuntimeCrash {
            name: name.to_string(),
            reason: format!("{exit} before becoming ready"),
        },
        Err(e) => e,
    }
}
