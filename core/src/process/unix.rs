//! Unix process management with safe spawn/kill using process groups
//!
//! Every child is spawned with `setsid()` so it leads its own session and
//! process group. Signals are then delivered with `killpg`, which reaches any
//! grandchildren a script may have started (a `node` server behind `npm`, a
//! shell behind a terminal server).
//!
//! `ESRCH` and `EPERM` while signalling are treated as "already gone".

// Allow unsafe code for this module since process management requires libc::setsid() calls
#![allow(unsafe_code)]

use super::{ProcessExit, SpawnRequest};
use crate::poll::poll_until;
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, error, warn};

/// Interval used while waiting for a signalled pid to disappear
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait after SIGKILL before giving up on a pid
const KILL_WAIT: Duration = Duration::from_secs(2);

/// A child process running as leader of its own process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    child: Child,
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Get the process group ID (same as PID for session leaders)
    pub fn pgid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ProcessExit> {
        let status = self.child.wait().await.map_err(|e| {
            CoreError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })?;
        Ok(ProcessExit {
            pid: self.pid(),
            exit_code: status.code(),
            signal: status.signal(),
        })
    }

    /// Check for exit without blocking
    pub fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
        let status = self.child.try_wait().map_err(|e| {
            CoreError::ProcessWait(format!("Failed to try_wait for process {}: {}", self.pid, e))
        })?;
        Ok(status.map(|s| ProcessExit {
            pid: self.pid(),
            exit_code: s.code(),
            signal: s.signal(),
        }))
    }

    /// Take the stdout handle for async reading, if available
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle for async reading, if available
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

/// Spawn a new process in its own process group
///
/// The child gets exactly the environment in `request.env`; stdout and stderr
/// are piped so the caller can read handshake lines and log output.
pub fn spawn(request: &SpawnRequest) -> Result<ChildProcess> {
    debug!("Spawning process: {} {:?}", request.program, request.args);

    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .env_clear()
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", request.program, e);
        CoreError::SpawnFailure {
            name: request.program.clone(),
            reason: e.to_string(),
        }
    })?;

    let raw_pid = child.id().ok_or_else(|| CoreError::SpawnFailure {
        name: request.program.clone(),
        reason: "spawned child did not have a pid".to_string(),
    })?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Spawned process {} in new process group", pid);

    Ok(ChildProcess { pid, child })
}

fn deliver(target: &str, pid: u32, signal: Signal, result: nix::Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            debug!("Sent {} to {} {}", signal, target, pid);
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!("{} {} already exited", target, pid);
            Ok(())
        }
        Err(Errno::EPERM) => {
            debug!("Permission denied signalling {} {} (likely already exited)", target, pid);
            Ok(())
        }
        Err(e) => {
            error!("Failed to send {} to {} {}: {}", signal, target, pid, e);
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {signal} to {target} {pid}: {e}"
            )))
        }
    }
}

/// Send a signal to the process group led by `pid`
pub fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    deliver(
        "process group",
        pid,
        signal,
        killpg(Pid::from_raw(pid as i32), signal),
    )
}

/// Send a signal to a single pid
pub fn signal_pid(pid: u32, signal: Signal) -> Result<()> {
    deliver("process", pid, signal, kill(Pid::from_raw(pid as i32), signal))
}

/// Send SIGTERM to the process group for graceful termination
pub fn signal_term_group(child: &ChildProcess) -> Result<()> {
    signal_group(child.pid(), Signal::SIGTERM)
}

/// Send SIGKILL to the process group for forceful termination
pub fn signal_kill_group(child: &ChildProcess) -> Result<()> {
    signal_group(child.pid(), Signal::SIGKILL)
}

/// Signal-zero liveness probe; never disturbs the target
///
/// `EPERM` means the pid exists but belongs to someone else, so it counts as
/// alive.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Graceful-then-forceful termination of an arbitrary pid
///
/// Process-group leaders are signalled as a group, anything else as a single
/// pid. SIGTERM is followed by up to `grace` of polling, then SIGKILL.
/// Returns an error only if the pid is still alive after SIGKILL.
pub async fn terminate_pid(pid: u32, grace: Duration) -> Result<()> {
    if !is_process_alive(pid) {
        return Ok(());
    }

    let nix_pid = Pid::from_raw(pid as i32);
    let is_group_leader = getpgid(Some(nix_pid)).ok() == Some(nix_pid);
    let send = |signal: Signal| {
        if is_group_leader {
            signal_group(pid, signal)
        } else {
            signal_pid(pid, signal)
        }
    };

    send(Signal::SIGTERM)?;
    if poll_until(move || async move { !is_process_alive(pid) }, EXIT_POLL_INTERVAL, grace).await {
        debug!("Process {} exited after SIGTERM", pid);
        return Ok(());
    }

    warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
    send(Signal::SIGKILL)?;
    if poll_until(move || async move { !is_process_alive(pid) }, EXIT_POLL_INTERVAL, KILL_WAIT).await {
        return Ok(());
    }

    Err(CoreError::ProcessSignal(format!(
        "Process {pid} still alive after SIGKILL"
    )))
}
