//! Integration tests for crash handling, the restart ceiling and health-driven resets

use super::{binary_service, wait_for_record, Harness};
use crate::health::test_server::TestServer;
use crate::supervisor::{MockInstruction, MockProcessAdapter};
use schema::{HostEvent, LivenessMode, ServiceStatus};
use std::time::Duration;
use tokio::time::sleep;

fn crashing() -> MockInstruction {
    MockInstruction::crash_after(Duration::from_millis(20), 1)
}

#[tokio::test]
async fn test_restart_ceiling_reaches_failed() {
    let mut h = Harness::new(MockProcessAdapter::with_fallback(crashing()));
    let mut config = binary_service("flaky");
    config.max_restarts = 3;
    config.restart_delay_ms = 10;
    assert_eq!(config.liveness_mode(), LivenessMode::ProcessExit);
    h.supervisor.register(config).unwrap();

    let mut rx = h.supervisor.watch("flaky").unwrap();
    h.supervisor.start("flaky").await.unwrap();
    let record = wait_for_record(&mut rx, Duration::from_secs(3), |r| r.status == ServiceStatus::Failed).await;

    // Three restarts; the fourth crash is terminal
    assert_eq!(record.restart_count, 3);
    assert!(record.last_error.unwrap().contains("restart ceiling"));
    assert_eq!(h.adapter.spawn_count().await, 4);

    // Nothing further is scheduled
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.adapter.spawn_count().await, 4);

    let events = h.drain_events();
    let scheduled: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            HostEvent::RestartScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![1, 2, 3]);
    let crashes = events
        .iter()
        .filter(|e| matches!(e, HostEvent::Crashed { .. }))
        .count();
    assert_eq!(crashes, 4);
    assert!(events.iter().any(|e| matches!(e, HostEvent::Failed { code, .. } if code == "PW006")));
    assert!(!events.iter().any(|e| matches!(e, HostEvent::RestartCounterReset { .. })));
}

#[tokio::test]
async fn test_crash_after_ceiling_stays_terminal() {
    let mut h = Harness::new(MockProcessAdapter::with_fallback(crashing()));
    let mut config = binary_service("flaky");
    config.max_restarts = 3;
    config.restart_delay_ms = 10;
    h.supervisor.register(config).unwrap();

    let mut rx = h.supervisor.watch("flaky").unwrap();
    h.supervisor.start("flaky").await.unwrap();
    wait_for_record(&mut rx, Duration::from_secs(3), |r| r.status == ServiceStatus::Failed).await;
    h.drain_events();

    // A manual start is allowed; its crash is terminal immediately
    let manual = h.supervisor.start("flaky").await.unwrap();
    assert_eq!(manual.status, ServiceStatus::Running);
    let record = wait_for_record(&mut rx, Duration::from_secs(2), |r| r.status == ServiceStatus::Failed).await;
    assert_eq!(record.restart_count, 3);
    assert!(record.pid.is_none());

    sleep(Duration::from_millis(150)).await;
    assert_eq!(h.adapter.spawn_count().await, 5);
    let events = h.drain_events();
    assert!(!events.iter().any(|e| matches!(e, HostEvent::RestartScheduled { .. })));
    assert!(events.iter().any(|e| matches!(e, HostEvent::Failed { code, .. } if code == "PW006")));
}

#[tokio::test]
async fn test_single_restart_ceiling_restarts_once() {
    let mut h = Harness::new(MockProcessAdapter::with_fallback(crashing()));
    let mut config = binary_service("flaky");
    config.max_restarts = 1;
    config.restart_delay_ms = 10;
    h.supervisor.register(config).unwrap();

    let mut rx = h.supervisor.watch("flaky").unwrap();
    h.supervisor.start("flaky").await.unwrap();
    let record = wait_for_record(&mut rx, Duration::from_secs(2), |r| r.status == ServiceStatus::Failed).await;
    assert_eq!(record.restart_count, 1);
    assert_eq!(h.adapter.spawn_count().await, 2);

    let events = h.drain_events();
    let scheduled = events
        .iter()
        .filter(|e| matches!(e, HostEvent::RestartScheduled { .. }))
        .count();
    assert_eq!(scheduled, 1);
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let mut h = Harness::new(MockProcessAdapter::with_fallback(crashing()));
    let mut config = binary_service("flaky");
    config.max_restarts = 4;
    config.restart_delay_ms = 40;
    h.supervisor.register(config).unwrap();
    h.supervisor.start("flaky").await.unwrap();

    let mut delays = Vec::new();
    for _ in 0..3 {
        let event = h
            .wait_for_event(Duration::from_secs(3), |e| matches!(e, HostEvent::RestartScheduled { .. }))
            .await
            .expect("restart should be scheduled");
        if let HostEvent::RestartScheduled { attempt, delay_ms, .. } = event {
            delays.push((attempt, delay_ms));
        }
    }
    assert_eq!(delays, vec![(1, 40), (2, 80), (3, 160)]);
    h.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn test_auto_restart_disabled_fails_on_first_crash() {
    let mut h = Harness::new(MockProcessAdapter::with_fallback(crashing()));
    let mut config = binary_service("oneshot");
    config.auto_restart = false;
    h.supervisor.register(config).unwrap();

    let mut rx = h.supervisor.watch("oneshot").unwrap();
    h.supervisor.start("oneshot").await.unwrap();
    let record = wait_for_record(&mut rx, Duration::from_secs(2), |r| r.status == ServiceStatus::Failed).await;
    // No restart was scheduled, so none is counted
    assert_eq!(record.restart_count, 0);

    let failed = h
        .wait_for_event(Duration::from_millis(500), |e| matches!(e, HostEvent::Failed { .. }))
        .await;
    assert!(matches!(failed, Some(HostEvent::Failed { code, .. }) if code == "PW004"));
    assert_eq!(h.adapter.spawn_count().await, 1);
}

#[tokio::test]
async fn test_crash_event_carries_exit_details() {
    let mut h = Harness::new(MockProcessAdapter::with_fallback(MockInstruction::crash_after(
        Duration::from_millis(20),
        7,
    )));
    let mut config = binary_service("worker");
    config.restart_delay_ms = 5_000;
    h.supervisor.register(config).unwrap();
    h.supervisor.start("worker").await.unwrap();

    let crashed = h
        .wait_for_event(Duration::from_secs(2), |e| matches!(e, HostEvent::Crashed { .. }))
        .await
        .expect("crash event");
    match crashed {
        HostEvent::Crashed {
            exit_code,
            restart_count,
            reason,
            ..
        } => {
            assert_eq!(exit_code, Some(7));
            assert_eq!(restart_count, 1);
            assert!(reason.contains("exited with code 7"), "{reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    h.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn test_successful_health_check_resets_restart_count() {
    let server = TestServer::start(200).await;
    let adapter = MockProcessAdapter::with_fallback(MockInstruction::long_running());
    adapter.add_instruction(crashing()).await;

    let mut h = Harness::new(adapter);
    let mut config = binary_service("model");
    config.restart_delay_ms = 10;
    config.health_check_url = Some(server.url("/health"));
    config.health_check_interval_ms = Some(150);
    assert_eq!(config.liveness_mode(), LivenessMode::HealthCheck);
    h.supervisor.register(config).unwrap();

    let mut rx = h.supervisor.watch("model").unwrap();
    h.supervisor.start("model").await.unwrap();
    wait_for_record(&mut rx, Duration::from_secs(2), |r| r.restart_count == 1).await;

    let reset = h
        .wait_for_event(Duration::from_secs(3), |e| matches!(e, HostEvent::RestartCounterReset { .. }))
        .await;
    assert!(matches!(reset, Some(HostEvent::RestartCounterReset { previous: 1, .. })));

    let record = h.supervisor.status("model").unwrap();
    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.restart_count, 0);
    assert!(server.hits() >= 1);

    h.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn test_failed_health_check_goes_through_crash_path() {
    let server = TestServer::start(200).await;
    let mut h = Harness::new(MockProcessAdapter::with_fallback(MockInstruction::long_running()));
    let mut config = binary_service("model");
    config.restart_delay_ms = 5_000;
    config.health_check_url = Some(server.url("/health"));
    config.health_check_interval_ms = Some(50);
    h.supervisor.register(config).unwrap();

    let first = h.supervisor.start("model").await.unwrap();
    server.set_status(503);

    let unhealthy = h
        .wait_for_event(Duration::from_secs(2), |e| matches!(e, HostEvent::Unhealthy { .. }))
        .await;
    assert!(unhealthy.is_some());

    let scheduled = h
        .wait_for_event(Duration::from_secs(1), |e| matches!(e, HostEvent::RestartScheduled { .. }))
        .await;
    assert!(matches!(scheduled, Some(HostEvent::RestartScheduled { attempt: 1, .. })));

    let record = h.supervisor.status("model").unwrap();
    assert_eq!(record.status, ServiceStatus::Crashed);
    assert_eq!(record.restart_count, 1);
    assert!(record.pid.is_none());
    assert!(h.ledger.snapshot().pids_for("model").is_empty());
    assert_ne!(first.pid, None);

    // Stopping a crashed service cancels the pending restart
    let stopped = h.supervisor.stop("model", false).await.unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);
    assert_eq!(h.adapter.spawn_count().await, 1);
}
