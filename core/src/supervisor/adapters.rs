//! Process adapters for abstracting process management
//!
//! The supervisor and the terminal manager never touch OS processes directly.
//! They spawn through a [`ProcessAdapter`] and control children through
//! [`ManagedProcess`], so the state machines run unchanged against real Unix
//! process groups or against [`MockProcessAdapter`] in tests.

use crate::process::{ProcessExit, SpawnRequest};
use crate::{CoreError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::TcpListener;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Boxed async reader over a child's output stream
pub type OutputStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Trait for spawning processes in a platform-agnostic way
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    /// Spawn a new managed process
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ManagedProcess>>;
}

/// Handle to one spawned child
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> u32;

    /// Wait for the process to exit
    ///
    /// Must be cancel-safe: the supervisor polls it inside `select!`.
    async fn wait(&mut self) -> Result<ProcessExit>;

    /// Ask the process to exit (SIGTERM to its group)
    async fn terminate(&mut self) -> Result<()>;

    /// Kill the process forcefully (SIGKILL to its group)
    async fn kill(&mut self) -> Result<()>;

    /// Take the child's stdout. Returns None if already taken.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Take the child's stderr. Returns None if already taken.
    fn take_stderr(&mut self) -> Option<OutputStream>;
}

/// Graceful-then-forceful stop shared by the supervisor and the terminal manager
///
/// Sends the graceful signal, waits up to `grace` for the exit, then kills and
/// reaps. Returns the exit if one was observed.
pub async fn stop_gracefully(
    process: &mut Box<dyn ManagedProcess>,
    grace: Duration,
) -> Option<ProcessExit> {
    let pid = process.pid();
    if let Err(e) = process.terminate().await {
        warn!("Failed to terminate process {} gracefully: {}", pid, e);
    }
    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(exit)) => return Some(exit),
        Ok(Err(e)) => warn!("Error waiting for process {}: {}", pid, e),
        Err(_) => debug!("Process {} ignored graceful stop for {:?}, killing", pid, grace),
    }
    kill_and_reap(process).await
}

/// Forceful kill followed by a bounded wait for the exit
pub async fn kill_and_reap(process: &mut Box<dyn ManagedProcess>) -> Option<ProcessExit> {
    let pid = process.pid();
    if let Err(e) = process.kill().await {
        warn!("Failed to kill process {}: {}", pid, e);
    }
    // SIGKILL cannot be ignored; the bound only guards a wedged wait
    match tokio::time::timeout(REAP_TIMEOUT, process.wait()).await {
        Ok(Ok(exit)) => Some(exit),
        _ => None,
    }
}

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Unix process adapter: every child leads its own process group
#[cfg(unix)]
#[derive(Copy, Clone, Debug, Default)]
pub struct UnixProcessAdapter;

#[cfg(unix)]
impl UnixProcessAdapter {
    /// Create a new Unix process adapter
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessAdapter for UnixProcessAdapter {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ManagedProcess>> {
        let child = crate::process::spawn(request)?;
        Ok(Box::new(UnixManagedProcess { child }))
    }
}

#[cfg(unix)]
struct UnixManagedProcess {
    child: crate::process::ChildProcess,
}

#[cfg(unix)]
#[async_trait]
impl ManagedProcess for UnixManagedProcess {
    fn pid(&self) -> u32 {
        self.child.pid()
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        self.child.wait().await
    }

    async fn terminate(&mut self) -> Result<()> {
        crate::process::signal_term_group(&self.child)
    }

    async fn kill(&mut self) -> Result<()> {
        crate::process::signal_kill_group(&self.child)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child.take_stdout().map(|s| Box::pin(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child.take_stderr().map(|s| Box::pin(s) as OutputStream)
    }
}

/// Scripted behaviour of one mock process
#[derive(Debug, Clone)]
pub struct MockInstruction {
    /// How long until the process exits on its own
    pub exit_delay: Duration,
    /// Exit code reported on a natural exit (None means killed by signal)
    pub exit_code: Option<i32>,
    /// Signal reported on a natural exit
    pub signal: Option<i32>,
    /// Whether SIGTERM ends the process; SIGKILL always does
    pub responds_to_signals: bool,
    /// Bind the request's injected `PORT` until exit
    pub binds_port: bool,
    /// Lines written to stdout at spawn
    pub stdout_lines: Vec<String>,
    /// Lines written to stderr at spawn
    pub stderr_lines: Vec<String>,
    /// Fail the spawn itself with this reason
    pub spawn_error: Option<String>,
}

impl Default for MockInstruction {
    fn default() -> Self {
        Self {
            exit_delay: Duration::from_millis(100),
            exit_code: Some(0),
            signal: None,
            responds_to_signals: true,
            binds_port: false,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            spawn_error: None,
        }
    }
}

impl MockInstruction {
    /// A process that stays up until it is signalled
    pub fn long_running() -> Self {
        Self {
            exit_delay: Duration::from_secs(3600),
            ..Self::default()
        }
    }

    /// A script that prints the ready handshake and stays up
    pub fn ready_script() -> Self {
        Self {
            stdout_lines: vec![r#"{"type":"ready"}"#.to_string()],
            ..Self::long_running()
        }
    }

    /// A process that crashes with `code` after `delay`
    pub fn crash_after(delay: Duration, code: i32) -> Self {
        Self {
            exit_delay: delay,
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// A spawn that fails outright
    pub fn spawn_failure(reason: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Bind the injected port for the life of the process
    pub fn binding_port(mut self) -> Self {
        self.binds_port = true;
        self
    }

    /// Add a stdout line
    pub fn with_stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout_lines.push(line.into());
        self
    }

    /// Add a stderr line
    pub fn with_stderr(mut self, line: impl Into<String>) -> Self {
        self.stderr_lines.push(line.into());
        self
    }

    /// Ignore SIGTERM
    pub fn ignoring_sigterm(mut self) -> Self {
        self.responds_to_signals = false;
        self
    }
}

/// Mock process adapter for testing
///
/// Instructions queued with [`add_instruction`](Self::add_instruction) are
/// consumed one per spawn; once the queue is empty the fallback is used.
#[derive(Debug, Clone)]
pub struct MockProcessAdapter {
    instructions: Arc<Mutex<VecDeque<MockInstruction>>>,
    fallback: MockInstruction,
    requests: Arc<Mutex<Vec<SpawnRequest>>>,
}

static NEXT_MOCK_PID: AtomicU32 = AtomicU32::new(40_000);

impl MockProcessAdapter {
    /// Create a new mock adapter whose fallback is [`MockInstruction::default`]
    pub fn new() -> Self {
        Self::with_fallback(MockInstruction::default())
    }

    /// Create a mock adapter that uses `fallback` once the queue is empty
    pub fn with_fallback(fallback: MockInstruction) -> Self {
        Self {
            instructions: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue instructions for the next spawned process
    pub async fn add_instruction(&self, instruction: MockInstruction) {
        self.instructions.lock().await.push_back(instruction);
    }

    /// Every request this adapter has been asked to spawn, in order
    pub async fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of spawn attempts so far
    pub async fn spawn_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

impl Default for MockProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessAdapter for MockProcessAdapter {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ManagedProcess>> {
        debug!("Spawning mock process for: {} {:?}", request.program, request.args);
        self.requests.lock().await.push(request.clone());

        let instruction = self
            .instructions
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(reason) = &instruction.spawn_error {
            return Err(CoreError::SpawnFailure {
                name: request.program.clone(),
                reason: reason.clone(),
            });
        }

        let listener = match (instruction.binds_port, request.injected_port()) {
            (true, Some(port)) => Some(TcpListener::bind(("127.0.0.1", port)).map_err(|e| {
                CoreError::SpawnFailure {
                    name: request.program.clone(),
                    reason: format!("mock could not bind port {port}: {e}"),
                }
            })?),
            _ => None,
        };

        let pid = NEXT_MOCK_PID.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockManagedProcess {
            pid,
            started_at: Instant::now(),
            stdout: Some(join_lines(&instruction.stdout_lines)),
            stderr: Some(join_lines(&instruction.stderr_lines)),
            instruction,
            listener,
            terminated: false,
            killed: false,
        }))
    }
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    out
}

struct MockManagedProcess {
    pid: u32,
    instruction: MockInstruction,
    started_at: Instant,
    listener: Option<TcpListener>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    terminated: bool,
    killed: bool,
}

impl MockManagedProcess {
    fn should_exit(&self) -> bool {
        self.killed
            || (self.terminated && self.instruction.responds_to_signals)
            || self.started_at.elapsed() >= self.instruction.exit_delay
    }

    fn create_exit(&self) -> ProcessExit {
        let (exit_code, signal) = if self.killed {
            (None, Some(9))
        } else if self.terminated && self.instruction.responds_to_signals {
            (None, Some(15))
        } else {
            (self.instruction.exit_code, self.instruction.signal)
        };
        ProcessExit {
            pid: self.pid,
            exit_code,
            signal,
        }
    }
}

#[async_trait]
impl ManagedProcess for MockManagedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        while !self.should_exit() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.listener = None;
        Ok(self.create_exit())
    }

    async fn terminate(&mut self) -> Result<()> {
        debug!("Terminating mock process {}", self.pid);
        self.terminated = true;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        debug!("Killing mock process {}", self.pid);
        self.killed = true;
        self.listener = None;
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout
            .take()
            .map(|bytes| Box::pin(std::io::Cursor::new(bytes)) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr
            .take()
            .map(|bytes| Box::pin(std::io::Cursor::new(bytes)) as OutputStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn request() -> SpawnRequest {
        SpawnRequest::new("mock")
    }

    #[tokio::test]
    async fn test_mock_natural_exit() {
        let adapter = MockProcessAdapter::new();
        adapter
            .add_instruction(MockInstruction::crash_after(Duration::from_millis(20), 3))
            .await;

        let mut process = adapter.spawn(&request()).await.unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.signal, None);
        assert_eq!(adapter.spawn_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_terminate_respected() {
        let adapter = MockProcessAdapter::with_fallback(MockInstruction::long_running());
        let mut process = adapter.spawn(&request()).await.unwrap();

        process.terminate().await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(1), process.wait())
            .await
            .expect("should exit after SIGTERM")
            .unwrap();
        assert_eq!(exit.signal, Some(15));
    }

    #[tokio::test]
    async fn test_mock_ignoring_sigterm_needs_kill() {
        let adapter =
            MockProcessAdapter::with_fallback(MockInstruction::long_running().ignoring_sigterm());
        let mut process = adapter.spawn(&request()).await.unwrap();

        let exit = stop_gracefully(&mut process, Duration::from_millis(50)).await;
        assert_eq!(exit.map(|e| e.signal), Some(Some(9)));
    }

    #[tokio::test]
    async fn test_mock_spawn_error() {
        let adapter = MockProcessAdapter::new();
        adapter
            .add_instruction(MockInstruction::spawn_failure("No such file"))
            .await;
        let err = adapter.spawn(&request()).await.err().unwrap();
        assert_eq!(err.code(), "PW002");
    }

    #[tokio::test]
    async fn test_mock_stdout_lines() {
        let adapter = MockProcessAdapter::with_fallback(
            MockInstruction::ready_script().with_stdout("listening"),
        );
        let mut process = adapter.spawn(&request()).await.unwrap();
        let stdout = process.take_stdout().unwrap();
        assert!(process.take_stdout().is_none());

        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(r#"{"type":"ready"}"#));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("listening"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_binds_injected_port_until_killed() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let adapter =
            MockProcessAdapter::with_fallback(MockInstruction::long_running().binding_port());
        let mut req = request();
        req.env.insert("PORT".to_string(), port.to_string());
        let mut process = adapter.spawn(&req).await.unwrap();

        assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_ok());
        process.kill().await.unwrap();
        process.wait().await.unwrap();
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_mock_pids_are_unique() {
        let adapter = MockProcessAdapter::with_fallback(MockInstruction::long_running());
        let a = adapter.spawn(&request()).await.unwrap();
        let b = adapter.spawn(&request()).await.unwrap();
        assert_ne!(a.pid(), b.pid());
    }
}
