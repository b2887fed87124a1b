//! Supervisor start/reconnect integration tests.
//!
//! These tests verify that starting and reconnecting always leaves exactly one
//! tracked worker alive, and that launch failures leave the supervisor untouched.

use std::time::Duration;

use kvs_relay::{
    Error, LaunchFailure, LaunchSettings, ProcessLauncher, Supervisor, SupervisorStatus,
    WorkerDescriptor,
};

use crate::fixtures::{
    eventually, fast_config, pid_exists, RecordingSink, WorkerDir, LOOPING_WORKER,
    STUBBORN_WORKER,
};

/// Test: Start then check liveness
/// Given a valid descriptor
/// When the supervisor starts it
/// Then the target id comes back and the worker is alive
#[tokio::test]
async fn test_start_returns_target_and_is_alive() {
    let dir = WorkerDir::new();
    dir.add_worker("cam1", LOOPING_WORKER);
    let sink = RecordingSink::new();
    let supervisor = dir.supervisor(sink.clone());

    let outcome = supervisor
        .start(WorkerDescriptor::new("cam1", "rtsp://u:p@host:554/x"))
        .await
        .unwrap();

    assert_eq!(outcome.target_id, "cam1");
    assert!(supervisor.is_alive().await);
    assert_eq!(supervisor.status().await, SupervisorStatus::Running);

    // Output relay is attached and tagged.
    assert!(
        eventually(Duration::from_secs(3), || async {
            sink.count_containing("[GStreamer] uri=") == 1
        })
        .await
    );
    let lines = sink.lines();
    assert!(lines.contains(&"[GStreamer] started cam1 video-only rtspsrc".to_string()));
    assert!(lines.contains(&"[GStreamer] uri=rtsp://u:p@host:554/x".to_string()));

    supervisor.shutdown().await;
}

/// Test: Launch with a missing binary
/// Given a launcher pointing at a binary that does not exist
/// When start is called
/// Then a spawn-failed LaunchError is returned and the supervisor stays Idle
#[tokio::test]
async fn test_missing_binary_leaves_supervisor_idle() {
    let dir = WorkerDir::new();
    let supervisor = Supervisor::new(
        ProcessLauncher::new(LaunchSettings::new(
            "/nonexistent/kvsWebrtcClientMasterGstSample",
            &dir.path,
        )),
        fast_config(),
        RecordingSink::new(),
    );

    let err = supervisor
        .start(WorkerDescriptor::new("cam1", "rtsp://u:p@host:554/x"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Launch {
            reason: LaunchFailure::SpawnFailed,
            ..
        }
    ));
    assert!(err.to_string().starts_with("spawn-failed"));
    assert_eq!(supervisor.status().await, SupervisorStatus::Idle);
    assert!(supervisor.current_target().await.is_none());

    // No monitor was scheduled, so nothing relaunches in the background.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(supervisor.restart_count(), 0);
    assert_eq!(supervisor.status().await, SupervisorStatus::Idle);
}

/// Test: Reconnect twice with the same descriptor
/// Given a running worker
/// When reconnect is called twice in succession
/// Then every superseded worker is gone and only the current one is alive
#[tokio::test]
async fn test_reconnect_twice_keeps_one_worker() {
    let dir = WorkerDir::new();
    dir.add_worker("cam1", LOOPING_WORKER);
    let supervisor = dir.supervisor(RecordingSink::new());
    let descriptor = WorkerDescriptor::new("cam1", "rtsp://u:p@host:554/x");

    let first = supervisor.start(descriptor.clone()).await.unwrap();
    let second = supervisor.reconnect(descriptor.clone()).await.unwrap();
    let third = supervisor.reconnect(descriptor).await.unwrap();

    assert!(!pid_exists(first.pid.unwrap()));
    assert!(!pid_exists(second.pid.unwrap()));
    assert!(pid_exists(third.pid.unwrap()));
    assert_eq!(supervisor.current_pid().await, third.pid);
    assert_eq!(supervisor.current_generation().await, Some(third.generation));

    supervisor.shutdown().await;
    assert!(!pid_exists(third.pid.unwrap()));
}

/// Test: Concurrent reconnects
/// Given several reconnect calls racing each other
/// When all of them return
/// Then exactly one of the launched workers is still alive
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconnects_leave_single_worker() {
    let dir = WorkerDir::new();
    dir.add_worker("cam1", LOOPING_WORKER);
    let supervisor = dir.supervisor(RecordingSink::new());
    let descriptor = WorkerDescriptor::new("cam1", "rtsp://host:554/x");

    supervisor.start(descriptor.clone()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let supervisor = supervisor.clone();
        let descriptor = descriptor.clone();
        tasks.push(tokio::spawn(async move { supervisor.reconnect(descriptor).await }));
    }

    let mut pids = Vec::new();
    for task in tasks {
        pids.push(task.await.unwrap().unwrap().pid.unwrap());
    }

    let alive: Vec<u32> = pids.iter().copied().filter(|p| pid_exists(*p)).collect();
    assert_eq!(alive.len(), 1, "expected one live worker, got {:?}", alive);
    assert_eq!(supervisor.current_pid().await, Some(alive[0]));

    supervisor.shutdown().await;
}

/// Test: Reconnect with a worker that ignores SIGTERM
/// Given a worker that traps TERM
/// When reconnect runs with a short stop grace
/// Then the old worker is killed after the grace and a new one starts
#[tokio::test]
async fn test_reconnect_kills_stubborn_worker_after_grace() {
    let dir = WorkerDir::new();
    dir.add_worker("cam1", STUBBORN_WORKER);
    let mut config = fast_config();
    config.stop_grace = Duration::from_millis(300);
    let supervisor = dir.supervisor_with(config, RecordingSink::new());
    let descriptor = WorkerDescriptor::new("cam1", "rtsp://host:554/x");

    let first = supervisor.start(descriptor.clone()).await.unwrap();
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = tokio::time::Instant::now();
    let second = supervisor.reconnect(descriptor).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(!pid_exists(first.pid.unwrap()));
    assert!(supervisor.is_alive().await);
    assert_ne!(first.generation, second.generation);

    supervisor.shutdown().await;
}

/// Test: Start switches to a different target
/// Given a worker for cam1
/// When start is called for cam2
/// Then cam2 becomes current and the descriptor used for relaunch is cam2's
#[tokio::test]
async fn test_start_switches_target() {
    let dir = WorkerDir::new();
    dir.add_worker("cam1", LOOPING_WORKER);
    dir.add_worker("cam2", LOOPING_WORKER);
    let sink = RecordingSink::new();
    let supervisor = dir.supervisor(sink.clone());

    supervisor
        .start(WorkerDescriptor::new("cam1", "rtsp://host:554/one"))
        .await
        .unwrap();
    let second = supervisor
        .start(WorkerDescriptor::new("cam2", "rtsp://host:554/two"))
        .await
        .unwrap();

    assert_eq!(supervisor.current_target().await.as_deref(), Some("cam2"));

    crate::fixtures::kill_out_of_band(second.pid.unwrap());
    assert!(
        eventually(Duration::from_secs(3), || async {
            supervisor.restart_count() == 1 && supervisor.is_alive().await
        })
        .await
    );
    assert_eq!(supervisor.current_target().await.as_deref(), Some("cam2"));
    assert!(
        eventually(Duration::from_secs(3), || async {
            sink.count_containing("started cam2") == 2
        })
        .await
    );
    assert_eq!(sink.count_containing("started cam1"), 1);

    supervisor.shutdown().await;
}

/// Test: Reconnect abandoned by its caller
/// Given a worker that ignores SIGTERM, so the handoff takes a while
/// When the caller gives up on reconnect mid-handoff
/// Then the reconnect still completes and the new worker stays supervised
#[tokio::test]
async fn test_abandoned_reconnect_still_completes() {
    let dir = WorkerDir::new();
    dir.add_worker("cam1", STUBBORN_WORKER);
    let mut config = fast_config();
    config.stop_grace = Duration::from_millis(500);
    let supervisor = dir.supervisor_with(config, RecordingSink::new());
    let descriptor = WorkerDescriptor::new("cam1", "rtsp://host:554/x");

    let first = supervisor.start(descriptor.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), supervisor.reconnect(descriptor)).await;
    assert!(abandoned.is_err());

    assert!(
        eventually(Duration::from_secs(5), || async {
            supervisor.status().await == SupervisorStatus::Running
                && supervisor.is_alive().await
        })
        .await,
        "supervisor did not settle after the caller went away"
    );
    let replacement = supervisor.current_pid().await.unwrap();
    assert_ne!(replacement, first.pid.unwrap());
    assert!(!pid_exists(first.pid.unwrap()));

    // Liveness polling still covers the replacement.
    crate::fixtures::kill_out_of_band(replacement);
    assert!(
        eventually(Duration::from_secs(5), || async {
            supervisor.restart_count() == 1 && supervisor.is_alive().await
        })
        .await,
        "replacement was not relaunched"
    );

    supervisor.shutdown().await;
}
