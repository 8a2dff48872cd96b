//! Integration tests for Unix process management
//!
//! These run real children and verify that:
//! - every child leads its own process group (via setsid)
//! - group signals reach grandchildren
//! - SIGTERM escalates to SIGKILL when ignored
//! - the orphan sweep kills pids left in a ledger by a previous run
//! - a terminal server that never binds fails within its readiness bound

#![cfg(unix)]
#![allow(unsafe_code)] // Required for libc calls in tests

use portwarden_core::config::TerminalSettings;
use portwarden_core::ledger::OrphanTracker;
use portwarden_core::process::{
    is_process_alive, signal_kill_group, signal_term_group, spawn, terminate_pid, SpawnRequest,
};
use portwarden_core::supervisor::UnixProcessAdapter;
use portwarden_core::terminal::{TerminalEnvironment, TerminalServerManager};
use portwarden_core::{PortAllocator, TerminalConfig};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

fn request(program: &str, args: &[&str]) -> SpawnRequest {
    let mut req = SpawnRequest::new(program);
    req.args = args.iter().map(|s| s.to_string()).collect();
    if let Ok(path) = std::env::var("PATH") {
        req.env.insert("PATH".to_string(), path);
    }
    req
}

async fn wait_until_dead(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !is_process_alive(pid)
}

#[tokio::test]
async fn test_process_group_isolation() {
    let mut child = spawn(&request("sleep", &["5"])).expect("Failed to spawn sleep");

    let parent_pgid = unsafe { libc::getpgrp() };
    assert_eq!(child.pid(), child.pgid());
    assert_ne!(child.pgid() as i32, parent_pgid);

    let child_pgid = unsafe { libc::getpgid(child.pid() as i32) };
    assert_eq!(child_pgid as u32, child.pid());

    signal_kill_group(&child).unwrap();
    let exit = child.wait().await.unwrap();
    assert_eq!(exit.signal, Some(libc::SIGKILL));
}

#[tokio::test]
async fn test_group_signal_reaches_grandchild() {
    let mut child = spawn(&request("sh", &["-c", "sleep 30 & echo $!; wait"])).unwrap();
    let stdout = child.take_stdout().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let grandchild: u32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();
    assert!(is_process_alive(grandchild));

    signal_term_group(&child).unwrap();
    child.wait().await.unwrap();
    // The grandchild is reparented to init, which reaps it
    assert!(wait_until_dead(grandchild, Duration::from_secs(3)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_pid_escalates_to_sigkill() {
    let mut child = spawn(&request(
        "sh",
        &["-c", "trap '' TERM; while true; do sleep 0.1; done"],
    ))
    .unwrap();
    let pid = child.pid();
    let reaper = tokio::spawn(async move { child.wait().await });

    let started = Instant::now();
    terminate_pid(pid, Duration::from_millis(300)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    let exit = reaper.await.unwrap().unwrap();
    assert_eq!(exit.signal, Some(libc::SIGKILL));
}

#[tokio::test]
async fn test_terminate_pid_of_missing_process_is_ok() {
    let mut child = spawn(&request("true", &[])).unwrap();
    let pid = child.pid();
    child.wait().await.unwrap();
    assert!(!is_process_alive(pid));
    terminate_pid(pid, Duration::from_millis(100)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orphan_sweep_kills_recorded_pids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pids.json");

    let mut child = spawn(&request("sleep", &["30"])).unwrap();
    let pid = child.pid();
    let reaper = tokio::spawn(async move { child.wait().await });

    {
        let previous_run = OrphanTracker::open(&path);
        previous_run.add_pid(pid, "api").unwrap();
        previous_run.add_pid(999_999, "gone").unwrap();
    }
    assert!(path.exists());

    let tracker = OrphanTracker::open(&path);
    let report = tracker.cleanup_orphans(Duration::from_millis(500)).await;
    assert_eq!(report.killed, vec![("api".to_string(), pid)]);
    assert_eq!(report.already_gone, vec![("gone".to_string(), 999_999)]);
    assert!(report.failures.is_empty());
    assert!(tracker.snapshot().is_empty());
    assert!(!path.exists());

    let exit = reaper.await.unwrap().unwrap();
    assert_eq!(exit.signal, Some(libc::SIGTERM));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_that_never_binds_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let server = dir.path().join("fake-server");
    std::fs::write(&server, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&server, std::fs::Permissions::from_mode(0o755)).unwrap();

    let base_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let settings = TerminalSettings {
        base_port,
        readiness_retries: 10,
        readiness_interval_ms: 50,
        close_grace_period_ms: 200,
        server_binary: Some(server.display().to_string()),
        default_shell: Some("/bin/sh".to_string()),
        ..TerminalSettings::default()
    };

    let ports = Arc::new(PortAllocator::new());
    let ledger = Arc::new(OrphanTracker::open(dir.path().join("pids.json")));
    let (event_tx, _events) = broadcast::channel(16);
    let manager = TerminalServerManager::with_environment(
        settings,
        TerminalEnvironment::default(),
        Arc::new(UnixProcessAdapter::new()),
        ports.clone(),
        ledger.clone(),
        event_tx,
    );

    let started = Instant::now();
    let err = manager
        .create_terminal(TerminalConfig::new("t1", "Shell"))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert_eq!(err.code(), "PW014");
    assert_eq!(ports.port_of("terminal:t1"), None);
    assert!(ledger.snapshot().is_empty());
    assert!(manager.get("t1").is_none());
}
