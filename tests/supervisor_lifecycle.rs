//! Lifecycle tests drive real child processes (`sh`) against an in-test TCP
//! listener standing in for the worker's health endpoint.
#![cfg(unix)]

use ocr_foreman::config::Config;
use ocr_foreman::error::{CrashReason, OcrError};
use ocr_foreman::supervisor::{Supervisor, WorkerState};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

async fn spawn_health_server() -> (u16, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 15\r\nconnection: close\r\n\r\n{\"status\":\"ok\"}",
                    )
                    .await;
            });
        }
    });
    (port, handle)
}

/// Accepts connections but never answers, so every probe runs into its
/// request timeout.
async fn spawn_black_hole() -> (u16, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            held.push(sock);
        }
    });
    (port, handle)
}

fn test_cfg(workdir: &Path, script: &str) -> Config {
    let mut cfg = Config::default();
    cfg.worker.command = "sh".into();
    cfg.worker.args = vec!["-c".into(), script.into()];
    cfg.worker.workdir = workdir.display().to_string();
    cfg.worker.env.clear();
    cfg.discovery.poll_interval_ms = 20;
    cfg.discovery.max_attempts = 5;
    cfg.discovery.fallback_port = 1;
    cfg.health.settle_delay_ms = 10;
    cfg.health.poll_interval_ms = 50;
    cfg.health.timeout_seconds = 3;
    cfg.shutdown.grace_ms = 300;
    cfg
}

#[tokio::test]
async fn becomes_ready_then_stops_cleanly() {
    let dir = tempdir().unwrap();
    let (port, server) = spawn_health_server().await;

    let cfg = test_cfg(
        dir.path(),
        &format!("echo {port} > port.txt; sleep 30"),
    );
    let mut supervisor = Supervisor::new(&cfg);

    let endpoint = supervisor.start().await.expect("worker should become ready");
    assert_eq!(endpoint.port, port);
    assert_eq!(supervisor.state(), WorkerState::Ready);
    assert!(supervisor.endpoint().is_some());
    assert!(supervisor.pid().is_some());

    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert!(supervisor.endpoint().is_none());

    server.abort();
}

#[tokio::test]
async fn fatal_stderr_line_before_ready_fails_start() {
    let dir = tempdir().unwrap();

    // No handshake file and nothing listening on the fallback port, so only
    // the stderr line can resolve the race.
    let cfg = test_cfg(
        dir.path(),
        "echo 'ERROR: model failed to load' 1>&2; sleep 30",
    );
    let mut supervisor = Supervisor::new(&cfg);

    let err = supervisor.start().await.expect_err("start should fail");
    match err {
        OcrError::WorkerCrashedBeforeReady {
            reason: CrashReason::LogLine(line),
        } => assert!(line.contains("model failed to load")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(supervisor.state(), WorkerState::Failed(_)));
}

#[tokio::test]
async fn exit_before_ready_fails_start_with_code() {
    let dir = tempdir().unwrap();
    let cfg = test_cfg(dir.path(), "exit 3");
    let mut supervisor = Supervisor::new(&cfg);

    let err = supervisor.start().await.expect_err("start should fail");
    match err {
        OcrError::WorkerCrashedBeforeReady {
            reason: CrashReason::Exit(code),
        } => assert_eq!(code, Some(3)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn health_timeout_fails_start_and_reaps_worker() {
    let dir = tempdir().unwrap();
    let mut cfg = test_cfg(dir.path(), "echo 1 > port.txt; sleep 30");
    cfg.health.timeout_seconds = 1;
    let mut supervisor = Supervisor::new(&cfg);

    let err = supervisor.start().await.expect_err("start should fail");
    assert!(matches!(err, OcrError::HealthCheckTimeout { .. }));
    assert!(matches!(supervisor.state(), WorkerState::Failed(_)));
    // The sleeping child was torn down on the failure path.
    assert!(supervisor.pid().is_none());
}

#[tokio::test]
async fn health_wait_is_bounded_by_the_configured_timeout() {
    let dir = tempdir().unwrap();
    let (port, server) = spawn_black_hole().await;
    let mut cfg = test_cfg(dir.path(), &format!("echo {port} > port.txt; sleep 30"));
    cfg.health.timeout_seconds = 1;
    let mut supervisor = Supervisor::new(&cfg);

    let started = Instant::now();
    let err = supervisor.start().await.expect_err("endpoint never answers");
    assert!(matches!(err, OcrError::HealthCheckTimeout { .. }));
    // Stalled probes count against the timeout; they must not stretch the
    // wait toward twice its configured length.
    assert!(started.elapsed() < Duration::from_millis(1900));
    server.abort();
}

#[tokio::test]
async fn cancelling_startup_tears_the_worker_down() {
    let dir = tempdir().unwrap();
    let cfg = test_cfg(dir.path(), "echo 1 > port.txt; sleep 30");
    let mut supervisor = Supervisor::new(&cfg);

    let (tx, mut cancel) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(true);
    });

    let started = Instant::now();
    let err = supervisor
        .start_cancellable(&mut cancel)
        .await
        .expect_err("cancellation should abort the readiness wait");
    assert!(matches!(err, OcrError::StartupCancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    // The spawned worker was torn down, not orphaned.
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert!(supervisor.pid().is_none());
}

#[tokio::test]
async fn fatal_line_beats_simultaneous_health_success() {
    let (port, server) = spawn_health_server().await;

    // The script hands over its port and emits the fatal line back to back,
    // so the log sink and the health probe race within the same poll cycle.
    for _ in 0..10 {
        let dir = tempdir().unwrap();
        let cfg = test_cfg(
            dir.path(),
            &format!("echo {port} > port.txt; echo 'ERROR: boom' 1>&2; sleep 30"),
        );
        let mut supervisor = Supervisor::new(&cfg);

        let err = supervisor.start().await.expect_err("fatal line must win");
        assert!(matches!(
            err,
            OcrError::WorkerCrashedBeforeReady {
                reason: CrashReason::LogLine(_),
            }
        ));
        assert!(matches!(supervisor.state(), WorkerState::Failed(_)));
    }
    server.abort();
}

#[tokio::test]
async fn simultaneous_exit_and_fatal_line_yield_one_crash_outcome() {
    // Exit and fatal line land in the same instant; whichever is observed,
    // start resolves exactly once, to a crash, never to Ready or a hang.
    for _ in 0..10 {
        let dir = tempdir().unwrap();
        let cfg = test_cfg(dir.path(), "echo 'ERROR: boom' 1>&2; exit 3");
        let mut supervisor = Supervisor::new(&cfg);

        let err = supervisor.start().await.expect_err("start should fail");
        match err {
            OcrError::WorkerCrashedBeforeReady { reason } => match reason {
                CrashReason::Exit(code) => assert_eq!(code, Some(3)),
                CrashReason::LogLine(line) => assert!(line.contains("boom")),
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(supervisor.state(), WorkerState::Failed(_)));
    }
}

#[tokio::test]
async fn teardown_after_observed_exit_skips_the_termination_signal() {
    let dir = tempdir().unwrap();
    let mut cfg = test_cfg(dir.path(), "exit 3");
    cfg.shutdown.grace_ms = 3000;
    let mut supervisor = Supervisor::new(&cfg);

    let started = Instant::now();
    let err = supervisor.start().await.expect_err("start should fail");
    assert!(matches!(err, OcrError::WorkerCrashedBeforeReady { .. }));
    // The reaped child gets no further signal; teardown returns without
    // sitting out the grace period.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn fatal_line_after_ready_only_degrades() {
    let dir = tempdir().unwrap();
    let (port, server) = spawn_health_server().await;

    let cfg = test_cfg(
        dir.path(),
        &format!("echo {port} > port.txt; sleep 1; echo 'CRITICAL: cache corrupt' 1>&2; sleep 30"),
    );
    let mut supervisor = Supervisor::new(&cfg);
    supervisor.start().await.expect("worker should become ready");

    let mut states = supervisor.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            states.changed().await.unwrap();
            if *states.borrow() == WorkerState::Degraded {
                break;
            }
        }
    })
    .await
    .expect("worker should degrade, not fail");

    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    server.abort();
}

#[tokio::test]
async fn exit_after_ready_reports_failure_without_restart() {
    let dir = tempdir().unwrap();
    let (port, server) = spawn_health_server().await;

    let cfg = test_cfg(
        dir.path(),
        &format!("echo {port} > port.txt; sleep 1; exit 7"),
    );
    let mut supervisor = Supervisor::new(&cfg);
    supervisor.start().await.expect("worker should become ready");

    let mut states = supervisor.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            states.changed().await.unwrap();
            if matches!(*states.borrow(), WorkerState::Failed(_)) {
                break;
            }
        }
    })
    .await
    .expect("post-ready exit should surface as Failed");

    // No auto-restart: the state stays Failed until the caller acts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(supervisor.state(), WorkerState::Failed(_)));

    supervisor.stop().await;
    server.abort();
}

#[tokio::test]
async fn stop_without_start_is_a_noop_and_reentrant() {
    let dir = tempdir().unwrap();
    let cfg = test_cfg(dir.path(), "sleep 30");
    let mut supervisor = Supervisor::new(&cfg);

    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn two_sessions_run_independently() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let (port_a, server_a) = spawn_health_server().await;
    let (port_b, server_b) = spawn_health_server().await;

    let cfg_a = test_cfg(dir_a.path(), &format!("echo {port_a} > port.txt; sleep 30"));
    let cfg_b = test_cfg(dir_b.path(), &format!("echo {port_b} > port.txt; sleep 30"));
    let mut sup_a = Supervisor::new(&cfg_a);
    let mut sup_b = Supervisor::new(&cfg_b);

    let ep_a = sup_a.start().await.unwrap();
    let ep_b = sup_b.start().await.unwrap();
    assert_eq!(ep_a.port, port_a);
    assert_eq!(ep_b.port, port_b);

    sup_a.stop().await;
    assert_eq!(sup_a.state(), WorkerState::Stopped);
    assert_eq!(sup_b.state(), WorkerState::Ready);

    sup_b.stop().await;
    server_a.abort();
    server_b.abort();
}
