//! Durable pid ledger for orphan cleanup
//!
//! The host can die without running its shutdown path. Every pid the
//! supervisor or terminal manager spawns is therefore recorded in a small JSON
//! file (see [`schema::PidLedger`]) that the next startup reads to kill
//! whatever is still running.
//!
//! Writes are crash-safe: the ledger is written to a temp file in the same
//! directory, fsynced, then renamed over the destination. The file is removed
//! entirely once the ledger becomes empty.

use crate::{CoreError, Result};
use schema::PidLedger;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name used under the OS temp directory
pub const LEDGER_FILE_NAME: &str = "portwarden-pids.json";

/// Environment variable overriding the ledger location
pub const LEDGER_ENV_VAR: &str = "PORTWARDEN_LEDGER";

/// Default grace period between SIGTERM and SIGKILL during a sweep
pub const DEFAULT_SWEEP_GRACE: Duration = Duration::from_secs(2);

/// Return the ledger path.
///
/// Order:
/// - `PORTWARDEN_LEDGER` env var if provided
/// - `<temp dir>/portwarden-pids.json` otherwise
pub fn default_ledger_path() -> PathBuf {
    match std::env::var_os(LEDGER_ENV_VAR) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => std::env::temp_dir().join(LEDGER_FILE_NAME),
    }
}

/// Outcome of [`OrphanTracker::cleanup_orphans`]
#[derive(Debug, Default)]
pub struct SweepReport {
    /// `(owner, pid)` pairs that were alive and have been terminated
    pub killed: Vec<(String, u32)>,
    /// `(owner, pid)` pairs that were already gone
    pub already_gone: Vec<(String, u32)>,
    /// Pids that could not be terminated
    pub failures: Vec<CoreError>,
}

/// File-backed `{ name → [pid] }` ledger
#[derive(Debug)]
pub struct OrphanTracker {
    path: PathBuf,
    ledger: Mutex<PidLedger>,
}

impl OrphanTracker {
    /// Open the ledger at [`default_ledger_path`]
    pub fn open_default() -> Self {
        Self::open(default_ledger_path())
    }

    /// Open the ledger at `path`
    ///
    /// A missing file is an empty ledger. A corrupt file is logged and
    /// treated as empty; it is overwritten on the next change.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ledger = match load_ledger(&path) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!("Ignoring unreadable pid ledger {}: {}", path.display(), e);
                PidLedger::new()
            }
        };
        debug!("Opened pid ledger {} with {} owners", path.display(), ledger.len());
        Self {
            path,
            ledger: Mutex::new(ledger),
        }
    }

    /// Location of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the in-memory ledger
    pub fn snapshot(&self) -> PidLedger {
        self.lock().clone()
    }

    /// Record `pid` under `name` and persist
    pub fn add_pid(&self, pid: u32, name: &str) -> Result<()> {
        let mut ledger = self.lock();
        if ledger.add(name, pid) {
            debug!("Ledger: recorded pid {} for '{}'", pid, name);
            self.persist(&ledger)?;
        }
        Ok(())
    }

    /// Remove `pid` from whichever entry holds it and persist
    ///
    /// Returns the owner it was recorded under.
    pub fn remove_pid(&self, pid: u32) -> Result<Option<String>> {
        let mut ledger = self.lock();
        let owner = ledger.remove(pid);
        if let Some(name) = &owner {
            debug!("Ledger: removed pid {} of '{}'", pid, name);
            self.persist(&ledger)?;
        }
        Ok(owner)
    }

    /// Kill every recorded pid that is still alive, then clear the ledger
    ///
    /// Individual kill failures are collected in the report as
    /// [`CoreError::OrphanSweepFailure`] and never abort the sweep.
    pub async fn cleanup_orphans(&self, grace: Duration) -> SweepReport {
        let entries: Vec<(String, u32)> = {
            let ledger = self.lock();
            ledger.iter().map(|(name, pid)| (name.to_string(), pid)).collect()
        };

        let mut report = SweepReport::default();
        for (name, pid) in entries {
            if !is_process_alive(pid) {
                debug!("Orphan pid {} ('{}') already gone", pid, name);
                report.already_gone.push((name, pid));
                continue;
            }
            info!("Killing orphaned process {} left by '{}'", pid, name);
            match terminate(pid, grace).await {
                Ok(()) => report.killed.push((name, pid)),
                Err(e) => {
                    let failure = CoreError::OrphanSweepFailure {
                        name,
                        pid,
                        reason: e.to_string(),
                    };
                    warn!("{}", failure);
                    report.failures.push(failure);
                }
            }
        }

        let mut ledger = self.lock();
        ledger.clear();
        if let Err(e) = self.persist(&ledger) {
            warn!("Failed to clear pid ledger {}: {}", self.path.display(), e);
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, PidLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, ledger: &PidLedger) -> Result<()> {
        if ledger.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        write_ledger_atomic(&self.path, ledger)
    }
}

/// Liveness probe that never disturbs the target (signal 0)
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        crate::process::is_process_alive(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

async fn terminate(pid: u32, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    {
        crate::process::terminate_pid(pid, grace).await
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        Err(CoreError::ProcessSignal(format!(
            "cannot signal pid {pid} on this platform"
        )))
    }
}

/// Read a ledger file; a missing file is an empty ledger
pub fn load_ledger(path: &Path) -> Result<PidLedger> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(serde_json::from_str(&data)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(PidLedger::new()),
        Err(e) => Err(CoreError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read ledger {}: {}", path.display(), e),
        ))),
    }
}

/// Atomically replace the ledger file with `ledger`
///
/// Steps: write a sibling temp file, `sync_all`, `rename` over the
/// destination, then best-effort fsync of the directory.
pub fn write_ledger_atomic(path: &Path, ledger: &PidLedger) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec(ledger)?;
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| {
                CoreError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to open temp ledger {}: {}", tmp_path.display(), e),
                ))
            })?;
        f.write_all(&json)?;
        let _ = f.sync_all();
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        CoreError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to replace ledger {}: {}", path.display(), e),
        ))
    })?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
