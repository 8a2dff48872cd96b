//! Service supervisor implementation
//!
//! This module provides the [`ProcessSupervisor`], an explicit registry of
//! named services. Each registered service gets its own tokio task (a
//! [`ServiceSupervisor`]) that owns the service's state machine; callers talk
//! to it through a [`SupervisorHandle`].
//!
//! ## Architecture
//!
//! ```text
//! ProcessSupervisor ──register──▶ spawn_supervisor ──▶ ServiceSupervisor task
//!        │                               ▲                    │
//!        └── start/stop/restart ──▶ ControlMsg (mpsc)          ├─▶ HostEvent (broadcast)
//!                                                             └─▶ ProcessRecord (watch)
//! ```
//!
//! Operations on one service are serialized by its task; different services
//! proceed in parallel. The port table and pid ledger are shared through
//! [`SupervisorContext`].

use crate::config::SupervisorSettings;
use crate::ledger::OrphanTracker;
use crate::port::PortAllocator;
use crate::{CoreError, Result};
use dashmap::DashMap;
use schema::{HostEvent, ProcessRecord, ServiceConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub mod adapters;
pub mod env;
pub mod restart_policy;
pub mod service_task;


pub use adapters::*;
pub use restart_policy::*;
pub use service_task::*;

/// Capacity of the lifecycle event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Control messages for one service task
#[derive(Debug)]
pub enum ControlMsg {
    /// Start the service; no-op if already running
    Start {
        /// Final record, or the reason the start failed
        reply: oneshot::Sender<Result<ProcessRecord>>,
    },
    /// Stop the service
    Stop {
        /// Skip the graceful signal and kill immediately
        force: bool,
        /// Record after the stop
        reply: oneshot::Sender<Result<ProcessRecord>>,
    },
    /// Stop, settle, start
    Restart {
        /// Final record, or the reason the start failed
        reply: oneshot::Sender<Result<ProcessRecord>>,
    },
    /// Stop the service and end the task
    Shutdown {
        /// Signalled once the task has stopped the service
        reply: oneshot::Sender<()>,
    },
}

/// Handle for controlling one service task
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    /// Service configuration
    pub config: ServiceConfig,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    record_rx: watch::Receiver<ProcessRecord>,
}

impl SupervisorHandle {
    fn send(&self, msg: ControlMsg) -> Result<()> {
        self.control_tx.send(msg).map_err(|_| {
            CoreError::Other(format!("Supervisor task for '{}' has shut down", self.config.name))
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ControlMsg,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| {
            CoreError::Other(format!("Supervisor task for '{}' dropped the request", self.config.name))
        })?
    }

    /// Start the service and wait for readiness
    pub async fn start(&self) -> Result<ProcessRecord> {
        self.request(|reply| ControlMsg::Start { reply }).await
    }

    /// Stop the service
    pub async fn stop(&self, force: bool) -> Result<ProcessRecord> {
        self.request(|reply| ControlMsg::Stop { force, reply }).await
    }

    /// Restart the service
    pub async fn restart(&self) -> Result<ProcessRecord> {
        self.request(|reply| ControlMsg::Restart { reply }).await
    }

    /// Stop the service and end its task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(ControlMsg::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current record snapshot
    pub fn record(&self) -> ProcessRecord {
        self.record_rx.borrow().clone()
    }

    /// Subscribe to record changes
    pub fn watch(&self) -> watch::Receiver<ProcessRecord> {
        self.record_rx.clone()
    }
}

/// Spawn the task for one service and return its handle
pub fn spawn_supervisor(config: ServiceConfig, ctx: SupervisorContext) -> SupervisorHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (record_tx, record_rx) = watch::channel(ProcessRecord::stopped(config.name.clone()));

    debug!("Spawning supervisor for service '{}'", config.name);
    let supervisor = ServiceSupervisor::new(config.clone(), ctx, record_tx, control_rx);
    tokio::spawn(supervisor.run());

    SupervisorHandle {
        config,
        control_tx,
        record_rx,
    }
}

/// Registry of supervised services
pub struct ProcessSupervisor {
    ctx: SupervisorContext,
    services: DashMap<String, SupervisorHandle>,
    shutting_down: AtomicBool,
}

impl ProcessSupervisor {
    /// Create a supervisor sharing `ports` and `ledger` with other components
    pub fn new(
        settings: SupervisorSettings,
        adapter: Arc<dyn adapters::ProcessAdapter>,
        ports: Arc<PortAllocator>,
        ledger: Arc<OrphanTracker>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ctx: SupervisorContext {
                settings,
                adapter,
                ports,
                ledger,
                event_tx,
            },
            services: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to lifecycle events of every service
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.ctx.event_tx.subscribe()
    }

    /// Sender side of the event bus, for components that publish alongside the supervisor
    pub fn event_sender(&self) -> broadcast::Sender<HostEvent> {
        self.ctx.event_tx.clone()
    }

    /// Shared port allocator
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ctx.ports
    }

    /// Register a service in the `stopped` state
    pub fn register(&self, config: ServiceConfig) -> Result<()> {
        if self.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }
        crate::config::validate_service(self.services.len(), &config)?;
        match self.services.entry(config.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CoreError::DuplicateService(config.name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("Registered service '{}'", config.name);
                slot.insert(spawn_supervisor(config, self.ctx.clone()));
                Ok(())
            }
        }
    }

    /// Names of every registered service, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn handle(&self, name: &str) -> Result<SupervisorHandle> {
        self.services
            .get(name)
            .map(|h| h.value().clone())
            .ok_or_else(|| CoreError::UnknownService(name.to_string()))
    }

    /// Start a service and wait until it is ready
    pub async fn start(&self, name: &str) -> Result<ProcessRecord> {
        if self.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }
        self.handle(name)?.start().await
    }

    /// Stop a service; `force` skips the graceful signal
    pub async fn stop(&self, name: &str, force: bool) -> Result<ProcessRecord> {
        self.handle(name)?.stop(force).await
    }

    /// Stop then start a service
    pub async fn restart(&self, name: &str) -> Result<ProcessRecord> {
        if self.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }
        self.handle(name)?.restart().await
    }

    /// Current record of one service
    pub fn status(&self, name: &str) -> Result<ProcessRecord> {
        Ok(self.handle(name)?.record())
    }

    /// Records of every service, sorted by name
    pub fn statuses(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self.services.iter().map(|e| e.value().record()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Watch one service's record
    pub fn watch(&self, name: &str) -> Result<watch::Receiver<ProcessRecord>> {
        Ok(self.handle(name)?.watch())
    }

    /// Whether [`shutdown_all`](Self::shutdown_all) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every service concurrently and clear all port assignments
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn shutdown_all(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        info!("Shutting down {} services", self.services.len());

        let handles: Vec<SupervisorHandle> = self.services.iter().map(|e| e.value().clone()).collect();
        let mut tasks = JoinSet::new();
        for handle in handles {
            tasks.spawn(async move { handle.shutdown().await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Service shutdown task failed: {}", e);
            }
        }

        self.ctx.ports.release_all();
        info!("All services stopped");
    }
}
