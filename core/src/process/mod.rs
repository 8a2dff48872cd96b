//! Process management utilities for the portwarden core library
//!
//! This module provides the platform-neutral request/exit types used by the
//! supervisor and terminal manager, plus the Unix implementation that spawns
//! every child as its own process-group leader so that graceful and forceful
//! termination reach the whole process tree.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;

/// Everything needed to launch one child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Program to execute (absolute path or looked up on `PATH`)
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Complete environment for the child; the host environment is not inherited
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

impl SpawnRequest {
    /// Request with no arguments, empty environment and inherited cwd
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Value of an environment variable in this request
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// The `PORT` this request injects, if any
    pub fn injected_port(&self) -> Option<u16> {
        self.env_var("PORT").and_then(|p| p.parse().ok())
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Pid of the exited process
    pub pid: u32,
    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal if the process was killed
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Whether the process exited with status 0
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        let exit = ProcessExit { pid: 1, exit_code: Some(3), signal: None };
        assert_eq!(exit.to_string(), "exited with code 3");
        assert!(!exit.is_success());

        let exit = ProcessExit { pid: 1, exit_code: None, signal: Some(9) };
        assert_eq!(exit.to_string(), "killed by signal 9");
    }

    #[test]
    fn test_injected_port() {
        let mut req = SpawnRequest::new("ttyd");
        assert_eq!(req.injected_port(), None);
        req.env.insert("PORT".to_string(), "7102".to_string());
        assert_eq!(req.injected_port(), Some(7102));
    }
}
