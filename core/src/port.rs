//! Port allocation and reservation
//!
//! A [`PortAllocator`] owns the live mapping of owner name (a service name or
//! `terminal:<id>`) to TCP port. Allocation order is deterministic:
//!
//! 1. the port the owner already holds, if it is still free
//! 2. the preferred port
//! 3. each alternative port, in order
//! 4. a linear scan of `preferred+1 ..= preferred+scan_width`
//!
//! Ports assigned to another owner are never handed out again, even if
//! nothing has bound them yet. Availability is probed by binding a throwaway
//! listener; any bind error counts as "unavailable".

use crate::health::{Probe, TcpProbe};
use crate::poll::poll_until;
use crate::{CoreError, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Width of the fallback scan above the preferred port
pub const DEFAULT_SCAN_WIDTH: u16 = 100;

/// Interval between readiness polls
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Connect timeout used when probing whether a port is accepting connections
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

const LOOPBACK: &str = "127.0.0.1";

/// Centralised owner → port table
#[derive(Debug)]
pub struct PortAllocator {
    assignments: DashMap<String, u16>,
    /// Serialises the probe-then-assign sequence across callers
    allocation_lock: Mutex<()>,
    scan_width: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    /// Create an allocator with the default scan width
    pub fn new() -> Self {
        Self::with_scan_width(DEFAULT_SCAN_WIDTH)
    }

    /// Create an allocator that scans `scan_width` ports above the preferred one
    pub fn with_scan_width(scan_width: u16) -> Self {
        Self {
            assignments: DashMap::new(),
            allocation_lock: Mutex::new(()),
            scan_width,
        }
    }

    /// Assign a free port to `name`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PortExhaustion`] if neither the preferred port,
    /// the alternatives nor the scan range yields a free port.
    pub fn allocate(&self, name: &str, preferred: u16, alternatives: &[u16]) -> Result<u16> {
        let _guard = self
            .allocation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = self.port_of(name) {
            if Self::is_available(current) {
                debug!("Reusing port {} for '{}'", current, name);
                return Ok(current);
            }
            debug!("Port {} held by '{}' is no longer free, reallocating", current, name);
            self.assignments.remove(name);
        }

        let scan_end = preferred.saturating_add(self.scan_width);
        let scan = (preferred.saturating_add(1)..=scan_end).filter(|_| self.scan_width > 0);
        let candidates = std::iter::once(preferred)
            .chain(alternatives.iter().copied())
            .chain(scan);

        for port in candidates {
            if port == 0 || self.is_assigned_elsewhere(port, name) {
                continue;
            }
            if Self::is_available(port) {
                self.assignments.insert(name.to_string(), port);
                if port == preferred {
                    info!("Allocated preferred port {} to '{}'", port, name);
                } else {
                    info!("Allocated port {} to '{}' (preferred {} unavailable)", port, name, preferred);
                }
                return Ok(port);
            }
            debug!("Port {} unavailable for '{}'", port, name);
        }

        Err(CoreError::PortExhaustion {
            service: name.to_string(),
            preferred,
            alternatives: alternatives.len(),
            scanned: self.scan_width,
        })
    }

    /// Drop the assignment for `name`; a no-op if it holds none
    pub fn release(&self, name: &str) -> Option<u16> {
        let released = self.assignments.remove(name).map(|(_, port)| port);
        if let Some(port) = released {
            debug!("Released port {} from '{}'", port, name);
        }
        released
    }

    /// Drop every assignment
    pub fn release_all(&self) {
        let count = self.assignments.len();
        self.assignments.clear();
        debug!("Released all {} port assignments", count);
    }

    /// Port currently assigned to `name`
    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.assignments.get(name).map(|entry| *entry.value())
    }

    /// Snapshot of all assignments
    pub fn assignments(&self) -> BTreeMap<String, u16> {
        self.assignments
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn is_assigned_elsewhere(&self, port: u16, name: &str) -> bool {
        self.assignments
            .iter()
            .any(|entry| *entry.value() == port && entry.key() != name)
    }

    /// Whether a throwaway listener can bind `port` on loopback and on all interfaces
    pub fn is_available(port: u16) -> bool {
        // Separate statements: each listener must be dropped before the next bind
        let loopback_free = TcpListener::bind(("127.0.0.1", port)).is_ok();
        if !loopback_free {
            return false;
        }
        let any_free = TcpListener::bind(("0.0.0.0", port)).is_ok();
        any_free
    }

    /// Whether something accepts TCP connections on `127.0.0.1:port`
    pub async fn is_accepting(port: u16) -> bool {
        Self::is_accepting_on(LOOPBACK, port).await
    }

    /// Whether something accepts TCP connections on `host:port`
    pub async fn is_accepting_on(host: &str, port: u16) -> bool {
        TcpProbe::new(host, port, CONNECT_PROBE_TIMEOUT)
            .check()
            .await
            .is_ok()
    }

    /// Wait until a child has bound `port`, or `timeout` elapses
    ///
    /// Readiness is judged by a successful loopback connect rather than a
    /// bind attempt, so the probe can never steal the port from the child.
    pub async fn wait_for_ready(port: u16, timeout: Duration) -> bool {
        Self::wait_for_ready_every(port, READY_POLL_INTERVAL, timeout).await
    }

    /// [`wait_for_ready`](Self::wait_for_ready) with a custom poll interval
    pub async fn wait_for_ready_every(port: u16, interval: Duration, timeout: Duration) -> bool {
        Self::wait_for_ready_on(LOOPBACK, port, interval, timeout).await
    }

    /// Poll `host:port` until it accepts a connection, or `timeout` elapses
    ///
    /// For children told to listen on one specific address, where a loopback
    /// connect would never succeed.
    pub async fn wait_for_ready_on(host: &str, port: u16, interval: Duration, timeout: Duration) -> bool {
        let ready = poll_until(move || Self::is_accepting_on(host, port), interval, timeout).await;
        if ready {
            debug!("Port {} on {} is accepting connections", port, host);
        } else {
            debug!("Port {} on {} not bound within {:?}", port, host, timeout);
        }
        ready
    }

    /// Best-effort termination of whatever process listens on `port`
    ///
    /// Returns the pids that were signalled. The current process is never
    /// targeted.
    pub async fn kill_occupant(port: u16, grace: Duration) -> Vec<u32> {
        let own_pid = std::process::id();
        let pids: Vec<u32> = find_listener_pids(port)
            .await
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        if pids.is_empty() {
            debug!("No occupant found for port {}", port);
            return pids;
        }

        for pid in &pids {
            warn!("Killing pid {} occupying port {}", pid, port);
            #[cfg(unix)]
            if let Err(e) = crate::process::terminate_pid(*pid, grace).await {
                warn!("Failed to kill occupant {} of port {}: {}", pid, port, e);
            }
            #[cfg(not(unix))]
            let _ = grace;
        }
        pids
    }
}

/// Pids listening on `port`, via `lsof`, falling back to `ss` on Linux
async fn find_listener_pids(port: u16) -> Vec<u32> {
    let lsof = tokio::process::Command::new("lsof")
        .args(["-t", "-n", "-P", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .await;
    if let Ok(output) = lsof {
        let pids = parse_pid_lines(&String::from_utf8_lossy(&output.stdout));
        if !pids.is_empty() {
            return pids;
        }
    }

    #[cfg(target_os = "linux")]
    {
        let ss = tokio::process::Command::new("ss")
            .args(["-tlnpH", &format!("sport = :{port}")])
            .output()
            .await;
        if let Ok(output) = ss {
            return parse_ss_pids(&String::from_utf8_lossy(&output.stdout));
        }
    }

    Vec::new()
}

fn parse_pid_lines(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Extract `pid=NNN` fields from `ss -p` output
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ss_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .split(|c: char| c == ',' || c.is_whitespace() || c == '(' || c == ')')
        .filter_map(|part| part.strip_prefix("pid="))
        .filter_map(|pid| pid.parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
