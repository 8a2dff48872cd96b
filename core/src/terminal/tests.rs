use super::*;
use crate::supervisor::{MockInstruction, MockProcessAdapter};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

struct Harness {
    manager: TerminalServerManager,
    adapter: MockProcessAdapter,
    ports: Arc<PortAllocator>,
    ledger: Arc<OrphanTracker>,
    events: broadcast::Receiver<HostEvent>,
    _dir: TempDir,
}

impl Harness {
    fn new(adapter: MockProcessAdapter, settings: TerminalSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(OrphanTracker::open(dir.path().join("pids.json")));
        let ports = Arc::new(PortAllocator::new());
        let (event_tx, events) = broadcast::channel(256);
        let manager = TerminalServerManager::with_environment(
            settings,
            TerminalEnvironment::default(),
            Arc::new(adapter.clone()),
            ports.clone(),
            ledger.clone(),
            event_tx,
        );
        Self {
            manager,
            adapter,
            ports,
            ledger,
            events,
            _dir: dir,
        }
    }

    async fn wait_for_event<F>(&mut self, limit: Duration, pred: F) -> Option<HostEvent>
    where
        F: Fn(&HostEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Ok(event)) if pred(&event) => return Some(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                _ => return None,
            }
        }
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_settings() -> TerminalSettings {
    TerminalSettings {
        base_port: free_port(),
        readiness_retries: 10,
        readiness_interval_ms: 20,
        command_settle_ms: 30,
        restart_delay_ms: 10,
        close_grace_period_ms: 100,
        default_shell: Some("/bin/bash".to_string()),
        ..TerminalSettings::default()
    }
}

fn serving() -> MockProcessAdapter {
    MockProcessAdapter::with_fallback(MockInstruction::long_running().binding_port())
}

#[test]
fn test_fatal_stderr_classification() {
    assert!(is_fatal_stderr("ERROR: Address already in use"));
    assert!(is_fatal_stderr("lws: can't bind to port 7100"));
    assert!(is_fatal_stderr("Failed to bind socket"));
    assert!(!is_fatal_stderr("N: Listening on port: 7100"));
}

#[test]
fn test_server_args_default_delivery() {
    let mut config = TerminalConfig::new("t1", "Shell");
    config.command = Some("claude".to_string());
    let settings = TerminalSettings::default();
    let args = server_args(&config, &settings, &TerminalEnvironment::default(), 7100, "/bin/zsh");
    assert_eq!(
        args,
        vec!["--port", "7100", "--interface", "127.0.0.1", "--writable", "/bin/zsh", "-l"]
    );
}

#[test]
fn test_server_args_spawn_delivery_and_production() {
    let mut config = TerminalConfig::new("t1", "Shell");
    config.command = Some("aider --yes".to_string());
    let settings = TerminalSettings {
        command_delivery: CommandDelivery::SpawnArgs,
        ..TerminalSettings::default()
    };
    let env = TerminalEnvironment {
        server_override: None,
        production: true,
        credential: Some("user:secret".to_string()),
    };
    let args = server_args(&config, &settings, &env, 7101, "/bin/bash");
    assert!(args.contains(&"--check-origin".to_string()));
    let cred = args.iter().position(|a| a == "--credential").unwrap();
    assert_eq!(args[cred + 1], "user:secret");
    assert_eq!(
        &args[args.len() - 3..],
        &["/bin/bash", "-c", "aider --yes; exec /bin/bash -l"]
    );
}

#[test]
fn test_url_uses_loopback_for_wildcard_interface() {
    assert_eq!(url_for("0.0.0.0", 7100), "http://127.0.0.1:7100");
    assert_eq!(url_for("127.0.0.1", 7101), "http://127.0.0.1:7101");
    assert_eq!(url_for("::1", 7102), "http://[::1]:7102");
}

#[test]
fn test_readiness_targets_configured_interface() {
    assert_eq!(reachable_host("0.0.0.0"), "127.0.0.1");
    assert_eq!(reachable_host("::"), "127.0.0.1");
    assert_eq!(reachable_host(""), "127.0.0.1");
    assert_eq!(reachable_host("10.0.0.5"), "10.0.0.5");
    assert_eq!(reachable_host("::1"), "::1");
}

#[test]
fn test_server_binary_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(OrphanTracker::open(dir.path().join("pids.json")));
    let (tx, _rx) = broadcast::channel(4);
    let settings = TerminalSettings {
        server_binary: Some("/opt/ttyd".to_string()),
        ..TerminalSettings::default()
    };
    let adapter: Arc<dyn ProcessAdapter> = Arc::new(MockProcessAdapter::new());
    let ports = Arc::new(PortAllocator::new());

    let configured = TerminalServerManager::with_environment(
        settings.clone(),
        TerminalEnvironment::default(),
        adapter.clone(),
        ports.clone(),
        ledger.clone(),
        tx.clone(),
    );
    assert_eq!(configured.server_binary(), "/opt/ttyd");

    let overridden = TerminalServerManager::with_environment(
        settings,
        TerminalEnvironment {
            server_override: Some("/usr/bin/gotty".to_string()),
            ..TerminalEnvironment::default()
        },
        adapter.clone(),
        ports.clone(),
        ledger.clone(),
        tx.clone(),
    );
    assert_eq!(overridden.server_binary(), "/usr/bin/gotty");

    let plain = TerminalServerManager::with_environment(
        TerminalSettings::default(),
        TerminalEnvironment::default(),
        adapter,
        ports,
        ledger,
        tx,
    );
    assert_eq!(plain.server_binary(), DEFAULT_SERVER_BINARY);
}

#[tokio::test]
async fn test_create_terminal_reports_ready_then_execute() {
    let settings = TerminalSettings {
        tool_bin_dirs: vec![PathBuf::from("/opt/tools/bin")],
        ..fast_settings()
    };
    let base_port = settings.base_port;
    let mut h = Harness::new(serving(), settings);

    let mut config = TerminalConfig::new("t1", "Claude");
    config.tool_id = Some("claude".to_string());
    config.command = Some("claude".to_string());
    config.env = BTreeMap::from([("FOO".to_string(), "bar".to_string())]);

    let info = h.manager.create_terminal(config).await.unwrap();
    assert_eq!(info.status, TerminalStatus::Running);
    assert_eq!(info.port, base_port);
    assert_eq!(info.url, format!("http://127.0.0.1:{base_port}"));
    assert_eq!(h.ports.port_of("terminal:t1"), Some(base_port));
    assert_eq!(h.ledger.snapshot().pids_for("terminal:t1").len(), 1);

    let ready = h
        .wait_for_event(Duration::from_secs(1), |e| matches!(e, HostEvent::TerminalReady { .. }))
        .await;
    assert!(matches!(ready, Some(HostEvent::TerminalReady { port, .. }) if port == base_port));
    let execute = h
        .wait_for_event(Duration::from_secs(1), |e| matches!(e, HostEvent::TerminalExecute { .. }))
        .await;
    assert!(matches!(execute, Some(HostEvent::TerminalExecute { command, .. }) if command == "claude"));

    let request = &h.adapter.requests().await[0];
    assert_eq!(request.program, DEFAULT_SERVER_BINARY);
    assert_eq!(request.env_var("TERM"), Some("xterm-256color"));
    assert_eq!(request.env_var("COLUMNS"), Some("120"));
    assert_eq!(request.env_var("LINES"), Some("40"));
    assert_eq!(request.env_var("FOO"), Some("bar"));
    assert!(request.env_var("PATH").unwrap().starts_with("/opt/tools/bin"));
    assert_eq!(request.injected_port(), Some(base_port));

    h.manager.cleanup().await;
}

#[tokio::test]
async fn test_spawn_args_delivery_skips_execute_event() {
    let settings = TerminalSettings {
        command_delivery: CommandDelivery::SpawnArgs,
        ..fast_settings()
    };
    let mut h = Harness::new(serving(), settings);
    let mut config = TerminalConfig::new("t1", "Aider");
    config.command = Some("aider".to_string());
    h.manager.create_terminal(config).await.unwrap();

    let execute = h
        .wait_for_event(Duration::from_millis(200), |e| matches!(e, HostEvent::TerminalExecute { .. }))
        .await;
    assert!(execute.is_none());
    let args = &h.adapter.requests().await[0].args;
    assert_eq!(args.last().map(String::as_str), Some("aider; exec /bin/bash -l"));
    h.manager.cleanup().await;
}

#[tokio::test]
async fn test_duplicate_terminal_is_rejected() {
    let h = Harness::new(serving(), fast_settings());
    h.manager.create_terminal(TerminalConfig::new("t1", "One")).await.unwrap();
    let err = h
        .manager
        .create_terminal(TerminalConfig::new("t1", "Again"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PW012");
    assert_eq!(h.adapter.spawn_count().await, 1);
    h.manager.cleanup().await;
}

#[tokio::test]
async fn test_server_that_never_binds_fails_within_bound() {
    let mut h = Harness::new(
        MockProcessAdapter::with_fallback(MockInstruction::long_running()),
        fast_settings(),
    );
    let started = std::time::Instant::now();
    let err = h
        .manager
        .create_terminal(TerminalConfig::new("t1", "Shell"))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(err.code(), "PW014");
    assert!(err.to_string().contains("not bound"), "{err}");

    assert!(h.manager.get("t1").is_none());
    assert_eq!(h.ports.port_of("terminal:t1"), None);
    assert!(h.ledger.snapshot().pids_for("terminal:t1").is_empty());
    let error = h
        .wait_for_event(Duration::from_millis(200), |e| matches!(e, HostEvent::TerminalError { .. }))
        .await;
    assert!(error.is_some());
}

#[tokio::test]
async fn test_fatal_stderr_fails_fast() {
    let settings = TerminalSettings {
        readiness_retries: 200,
        readiness_interval_ms: 50,
        ..fast_settings()
    };
    let h = Harness::new(
        MockProcessAdapter::with_fallback(
            MockInstruction::long_running().with_stderr("ERROR on_bind: address already in use"),
        ),
        settings,
    );
    let started = std::time::Instant::now();
    let err = h
        .manager
        .create_terminal(TerminalConfig::new("t1", "Shell"))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(err.to_string().contains("address already in use"), "{err}");
    assert_eq!(h.ports.port_of("terminal:t1"), None);
}

#[tokio::test]
async fn test_server_exit_during_startup_fails() {
    let h = Harness::new(
        MockProcessAdapter::with_fallback(MockInstruction::crash_after(Duration::from_millis(10), 1)),
        TerminalSettings {
            readiness_retries: 200,
            ..fast_settings()
        },
    );
    let err = h
        .manager
        .create_terminal(TerminalConfig::new("t1", "Shell"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exited with code 1"), "{err}");
}

#[tokio::test]
async fn test_close_releases_everything() {
    let mut h = Harness::new(serving(), fast_settings());
    h.manager.create_terminal(TerminalConfig::new("t1", "Shell")).await.unwrap();

    h.manager.close_terminal("t1").await.unwrap();
    assert!(h.manager.get("t1").is_none());
    assert_eq!(h.ports.port_of("terminal:t1"), None);
    assert!(h.ledger.snapshot().pids_for("terminal:t1").is_empty());
    let closed = h
        .wait_for_event(Duration::from_millis(500), |e| matches!(e, HostEvent::TerminalClosed { .. }))
        .await;
    assert!(closed.is_some());

    let err = h.manager.close_terminal("t1").await.unwrap_err();
    assert_eq!(err.code(), "PW013");
}

#[tokio::test]
async fn test_unexpected_exit_drops_instance() {
    let mut h = Harness::new(
        MockProcessAdapter::with_fallback(
            MockInstruction::crash_after(Duration::from_millis(300), 0).binding_port(),
        ),
        fast_settings(),
    );
    h.manager.create_terminal(TerminalConfig::new("t1", "Shell")).await.unwrap();

    let error = h
        .wait_for_event(Duration::from_secs(2), |e| matches!(e, HostEvent::TerminalError { .. }))
        .await;
    assert!(error.is_some());
    assert!(h.manager.get("t1").is_none());
    assert_eq!(h.ports.port_of("terminal:t1"), None);
}

#[tokio::test]
async fn test_restart_terminal_spawns_fresh_server() {
    let h = Harness::new(serving(), fast_settings());
    let first = h.manager.create_terminal(TerminalConfig::new("t1", "Shell")).await.unwrap();
    let second = h.manager.restart_terminal("t1").await.unwrap();
    assert_ne!(first.pid, second.pid);
    assert_eq!(second.status, TerminalStatus::Running);
    assert_eq!(h.adapter.spawn_count().await, 2);

    let err = h.manager.restart_terminal("missing").await.unwrap_err();
    assert_eq!(err.code(), "PW013");
    h.manager.cleanup().await;
}

#[tokio::test]
async fn test_queries_and_cleanup() {
    let mut h = Harness::new(serving(), fast_settings());
    for (id, tool) in [("a", Some("claude")), ("b", Some("claude")), ("c", None)] {
        let mut config = TerminalConfig::new(id, id);
        config.tool_id = tool.map(str::to_string);
        h.manager.create_terminal(config).await.unwrap();
    }

    let ports: Vec<u16> = h.manager.list().iter().map(|i| i.port).collect();
    assert_eq!(ports.len(), 3);
    assert!(ports[0] != ports[1] && ports[1] != ports[2] && ports[0] != ports[2]);

    let claude: Vec<String> = h.manager.by_tool("claude").into_iter().map(|i| i.id).collect();
    assert_eq!(claude, vec!["a", "b"]);

    let summary = h.manager.status_summary();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.running, 3);

    assert_eq!(h.manager.cleanup().await, 3);
    assert_eq!(h.manager.status_summary().total, 0);
    assert!(h.ports.assignments().is_empty());
    let cleaned = h
        .wait_for_event(Duration::from_millis(500), |e| matches!(e, HostEvent::TerminalCleaned { .. }))
        .await;
    assert!(matches!(cleaned, Some(HostEvent::TerminalCleaned { closed: 3, .. })));
}
