//! Shared test utilities and fixtures
//!
//! Every bridge here talks to the in-memory fake worker from
//! `flix_bridge::fake`; no JVM is needed.

#![allow(dead_code)]

use flix_bridge::fake::FakeSpawner;
use flix_bridge::{
    BridgeConfig, BridgeEvent, FlixBridge, RestartPolicy, TimeoutConfig, WorkerState,
};
use tokio::sync::mpsc;

pub const MAIN_URI: &str = "file:///a.flix";
pub const MAIN_SRC: &str = "def main(): Unit = ()";

/// Short timeouts and quick restarts so paused-clock tests stay readable.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        timeouts: TimeoutConfig {
            startup_secs: 5,
            query_secs: 5,
            progress_secs: 60,
            start_attempts: 1,
            ..TimeoutConfig::default()
        },
        restart: RestartPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RestartPolicy::default()
        },
        ..BridgeConfig::default()
    }
}

pub fn start_bridge(fake: &FakeSpawner) -> (FlixBridge, mpsc::UnboundedReceiver<BridgeEvent>) {
    FlixBridge::with_spawner(test_config(), fake.clone())
}

/// Everything emitted so far, without waiting.
pub fn drain_events(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

pub async fn wait_for_state(bridge: &FlixBridge, wanted: WorkerState) {
    let mut state = bridge.watch_state();
    state
        .wait_for(|s| *s == wanted)
        .await
        .expect("bridge dropped its state channel");
}

/// The `request` tag of every job request the worker has seen.
pub fn request_names(fake: &FakeSpawner) -> Vec<String> {
    fake.job_requests()
        .iter()
        .map(|r| r["request"].as_str().unwrap_or_default().to_string())
        .collect()
}
