//! Worker lifecycle seen through the public facade.

use std::time::Duration;

use flix_bridge::fake::{FakeSpawner, Reply, default_reply};
use flix_bridge::{
    BridgeConfig, BridgeError, BridgeEvent, FlixBridge, JobPayload, NotifyLevel, RestartPolicy,
    WorkerState,
};

use crate::common::{MAIN_SRC, MAIN_URI, drain_events, start_bridge, test_config, wait_for_state};

#[tokio::test(start_paused = true)]
async fn worker_that_never_starts_becomes_unavailable() {
    let fake = FakeSpawner::new(|_| Reply::Silent);
    let config = BridgeConfig {
        restart: RestartPolicy {
            max_retries: 2,
            ..test_config().restart
        },
        ..test_config()
    };
    let (bridge, mut events) = FlixBridge::with_spawner(config, fake.clone());

    let early = bridge.submit(JobPayload::Version);
    assert!(matches!(early.wait().await, Err(BridgeError::Startup(_))));

    wait_for_state(&bridge, WorkerState::Unavailable).await;
    assert_eq!(
        bridge.submit(JobPayload::Version).wait().await,
        Err(BridgeError::Unavailable)
    );
    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e,
        BridgeEvent::Notify { level: NotifyLevel::Error, message } if message.contains("unavailable")
    )));
}

#[tokio::test(start_paused = true)]
async fn manual_restart_recovers_from_unavailable() {
    let fake = FakeSpawner::responsive();
    fake.fail_next_spawns(10);
    let config = BridgeConfig {
        restart: RestartPolicy {
            max_retries: 1,
            ..test_config().restart
        },
        ..test_config()
    };
    let (bridge, _events) = FlixBridge::with_spawner(config, fake.clone());
    wait_for_state(&bridge, WorkerState::Unavailable).await;

    fake.fail_next_spawns(0);
    bridge.restart();
    wait_for_state(&bridge, WorkerState::Ready).await;
    assert!(bridge.version().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn restart_keeps_queued_jobs() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("cmd/runMain") => Reply::Silent,
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);
    wait_for_state(&bridge, WorkerState::Ready).await;

    let stuck = bridge.submit(JobPayload::run_main(None, None));
    let queued = bridge.submit(JobPayload::Version);
    fake.wait_for_requests(2).await;
    bridge.restart();

    assert_eq!(stuck.wait().await, Err(BridgeError::Cancelled));
    assert_eq!(queued.wait().await.unwrap()["minor"], 35);
    assert_eq!(fake.spawn_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_worker_and_fails_pending_jobs() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("cmd/runTests") => Reply::Silent,
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);
    let observer = bridge.clone();
    wait_for_state(&bridge, WorkerState::Ready).await;

    let pending = bridge.submit(JobPayload::run_tests::<&str>(&[]));
    fake.wait_for_requests(2).await;
    bridge.shutdown().await;

    assert_eq!(pending.wait().await, Err(BridgeError::ShutDown));
    assert_eq!(observer.state(), WorkerState::Stopped);
    fake.wait_for_requests(3).await;
    assert!(
        fake.requests()
            .iter()
            .any(|r| r["request"] == "api/shutdown")
    );
}

#[tokio::test(start_paused = true)]
async fn worker_crashing_on_every_document_gives_up_after_max_retries() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("api/addUri") => Reply::Crash,
        _ => default_reply(request),
    });
    let config = test_config();
    let max_retries = config.restart.max_retries;
    let (bridge, _events) = FlixBridge::with_spawner(config, fake.clone());

    bridge.add_document(MAIN_URI, MAIN_SRC);
    tokio::time::timeout(
        Duration::from_secs(3600),
        wait_for_state(&bridge, WorkerState::Unavailable),
    )
    .await
    .expect("crash loop never gave up");

    assert_eq!(fake.spawn_count(), 1 + max_retries as usize);
    assert_eq!(
        bridge.submit(JobPayload::Version).wait().await,
        Err(BridgeError::Unavailable)
    );
}
