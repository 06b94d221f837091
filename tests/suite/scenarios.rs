//! End-to-end editor scenarios against the fake worker.

use std::time::Duration;

use flix_bridge::fake::{FakeSpawner, Reply, default_reply};
use flix_bridge::{BridgeError, BridgeEvent, JobPayload, Position, WorkerState};
use serde_json::json;

use crate::common::{MAIN_SRC, MAIN_URI, drain_events, request_names, start_bridge, wait_for_state};

#[tokio::test(start_paused = true)]
async fn opened_document_is_checked_with_its_exact_text() {
    let fake = FakeSpawner::responsive();
    let (bridge, mut events) = start_bridge(&fake);

    bridge.add_document(MAIN_URI, MAIN_SRC);
    let check = bridge.submit(JobPayload::Check {
        uri: Some(MAIN_URI.into()),
    });
    check.wait().await.unwrap();

    let requests = fake.job_requests();
    assert_eq!(requests[0]["request"], "api/addUri");
    assert_eq!(requests[0]["src"], MAIN_SRC);
    assert_eq!(requests[1]["request"], "lsp/check");
    assert_eq!(requests[1]["uri"], MAIN_URI);

    let events = drain_events(&mut events);
    assert!(events.contains(&BridgeEvent::Diagnostics {
        uri: MAIN_URI.into(),
        items: vec![],
    }));
    assert!(bridge.diagnostics().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn check_errors_are_published_and_replaced_by_the_next_check() {
    let fake = FakeSpawner::new(|request| {
        if request["request"] == "lsp/check" && request["uri"] == MAIN_URI {
            Reply::Success(json!([{
                "uri": MAIN_URI,
                "diagnostics": [{
                    "range": { "start": { "line": 0, "character": 19 }, "end": { "line": 0, "character": 21 } },
                    "severity": 1,
                    "message": "Unexpected type."
                }]
            }]))
        } else {
            default_reply(request)
        }
    });
    let (bridge, _events) = start_bridge(&fake);

    bridge.add_document(MAIN_URI, "def main(): Unit = 42");
    bridge.submit(JobPayload::Version).wait().await.unwrap();

    let snapshot = bridge.diagnostics().await;
    assert_eq!(snapshot.error_count(), 1);
    let items = snapshot.for_uri(MAIN_URI).unwrap();
    assert_eq!(
        items[0].display_with_location("a.flix"),
        "a.flix:1:20: error: [flix] Unexpected type."
    );

    // A project-wide check that reports nothing clears it.
    bridge.check();
    bridge.submit(JobPayload::Version).wait().await.unwrap();
    assert!(bridge.diagnostics().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_check_leaves_diagnostics_cleared() {
    let fake = FakeSpawner::new(|request| match (request["request"].as_str(), request["uri"].as_str()) {
        (Some("lsp/check"), Some(MAIN_URI)) => Reply::Success(json!([{
            "uri": MAIN_URI,
            "diagnostics": [{
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 3 } },
                "severity": 1,
                "message": "Undefined name."
            }]
        }])),
        (Some("lsp/check"), None) => Reply::Failure(json!("compiler exploded")),
        _ => default_reply(request),
    });
    let (bridge, mut events) = start_bridge(&fake);

    bridge.add_document(MAIN_URI, MAIN_SRC);
    bridge.submit(JobPayload::Version).wait().await.unwrap();
    assert_eq!(bridge.diagnostics().await.error_count(), 1);
    drain_events(&mut events);

    let check = bridge.submit(JobPayload::Check { uri: None });
    assert!(check.wait().await.is_err());
    bridge.submit(JobPayload::Version).wait().await.unwrap();

    assert!(bridge.diagnostics().await.is_empty());
    let seen = drain_events(&mut events);
    assert!(seen.contains(&BridgeEvent::DiagnosticsCleared {
        uri: MAIN_URI.into()
    }));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, BridgeEvent::Diagnostics { .. })));
}

#[tokio::test(start_paused = true)]
async fn crash_fails_every_outstanding_job_then_worker_comes_back() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("cmd/runMain") => Reply::After(Duration::from_secs(1), Box::new(Reply::Crash)),
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);

    let in_flight = bridge.submit(JobPayload::run_main(None, None));
    let queued_version = bridge.submit(JobPayload::Version);
    let queued_hover = bridge.submit(JobPayload::Hover {
        uri: MAIN_URI.into(),
        position: Position::new(0, 0),
    });

    for ticket in [in_flight, queued_version, queued_hover] {
        assert!(matches!(
            ticket.wait().await,
            Err(BridgeError::ProcessCrashed(_))
        ));
    }

    wait_for_state(&bridge, WorkerState::Ready).await;
    assert_eq!(fake.spawn_count(), 2);

    let version = bridge.version().await.unwrap();
    assert_eq!(version.to_string(), "0.35-rev0");
    assert_eq!(request_names(&fake), ["cmd/runMain", "api/version"]);
}

#[tokio::test(start_paused = true)]
async fn open_documents_are_replayed_after_a_crash() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("cmd/runBenchmarks") => Reply::Crash,
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);

    bridge.add_document(MAIN_URI, MAIN_SRC);
    let crashed = bridge.submit(JobPayload::RunBenchmarks);
    assert!(matches!(
        crashed.wait().await,
        Err(BridgeError::ProcessCrashed(_))
    ));

    // Queued during the outage; must run after the replay.
    let version = bridge.submit(JobPayload::Version);
    version.wait().await.unwrap();

    assert_eq!(
        request_names(&fake),
        [
            "api/addUri",
            "lsp/check",
            "cmd/runBenchmarks",
            "api/addUri",
            "lsp/check",
            "api/version"
        ]
    );
    assert_eq!(fake.job_requests()[3]["src"], MAIN_SRC);
}

#[tokio::test(start_paused = true)]
async fn run_tests_sends_names_joined_and_returns_worker_result() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("cmd/runTests") => Reply::Success(json!({
            "passed": 1,
            "failed": 1,
            "results": [
                { "name": "a", "outcome": "pass" },
                { "name": "b", "outcome": "fail" }
            ]
        })),
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);

    let result = bridge.run_tests(&["a", "b"]).await.unwrap();

    let requests = fake.job_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["request"], "cmd/runTests");
    assert_eq!(requests[0]["filter"], "a b");
    assert_eq!(result["passed"], 1);
    assert_eq!(result["failed"], 1);
}
