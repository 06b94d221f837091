//! Correlation and ordering guarantees of the job queue.

use std::time::Duration;

use flix_bridge::fake::{FakeSpawner, Reply, default_reply, response_frame};
use flix_bridge::{BridgeError, JobPayload, Position};
use serde_json::json;

use crate::common::{MAIN_URI, request_names, start_bridge};

/// Answers every job with its own id so crossed replies are visible.
fn echo_worker() -> FakeSpawner {
    FakeSpawner::new(|request| {
        if request["id"] == 0 {
            default_reply(request)
        } else {
            Reply::Success(json!({ "echo": request["id"], "request": request["request"] }))
        }
    })
}

#[tokio::test(start_paused = true)]
async fn responses_reach_the_caller_that_sent_them() {
    let fake = echo_worker();
    let (bridge, _events) = start_bridge(&fake);
    let position = Position::new(1, 2);

    let tickets = vec![
        bridge.submit(JobPayload::Version),
        bridge.submit(JobPayload::Hover {
            uri: MAIN_URI.into(),
            position,
        }),
        bridge.submit(JobPayload::run_tests(&["t1"])),
        bridge.submit(JobPayload::Codelens {
            uri: MAIN_URI.into(),
        }),
        bridge.submit(JobPayload::RunBenchmarks),
    ];

    for ticket in tickets {
        let id = ticket.id();
        let kind = ticket.kind();
        let result = ticket.wait().await.unwrap();
        assert_eq!(result["echo"], id.get());
        assert_eq!(result["request"], kind.wire_name());
    }
}

#[tokio::test(start_paused = true)]
async fn document_update_is_sent_before_the_check_that_follows_it() {
    let fake = FakeSpawner::responsive();
    let (bridge, _events) = start_bridge(&fake);

    bridge.add_document(MAIN_URI, "def main(): Unit = 1");
    bridge.add_document(MAIN_URI, "def main(): Unit = ()");
    bridge.remove_document(MAIN_URI);
    bridge.check();
    bridge.submit(JobPayload::Version).wait().await.unwrap();

    assert_eq!(
        request_names(&fake),
        [
            "api/addUri",
            "lsp/check",
            "api/addUri",
            "lsp/check",
            "api/remUri",
            "lsp/check",
            "api/version"
        ]
    );
    let requests = fake.job_requests();
    assert_eq!(requests[0]["src"], "def main(): Unit = 1");
    assert_eq!(requests[2]["src"], "def main(): Unit = ()");
}

#[tokio::test(start_paused = true)]
async fn only_one_job_is_in_flight_at_a_time() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        // The fake keeps reading while silent, so a second dispatch would show up.
        Some("lsp/uses") => Reply::Silent,
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);

    let uses = bridge.submit(JobPayload::Uses {
        uri: MAIN_URI.into(),
        position: Position::new(0, 0),
    });
    let version = bridge.submit(JobPayload::Version);
    let benchmarks = bridge.submit(JobPayload::RunBenchmarks);

    fake.wait_for_requests(2).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(request_names(&fake), ["lsp/uses"]);

    assert!(uses.wait().await.unwrap_err().is_timeout());
    assert!(version.wait().await.is_ok());
    assert!(benchmarks.wait().await.is_ok());
    assert_eq!(
        request_names(&fake),
        ["lsp/uses", "api/version", "cmd/runBenchmarks"]
    );
}

#[tokio::test(start_paused = true)]
async fn stray_and_duplicate_responses_are_dropped() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("cmd/runMain") => Reply::Many(vec![
            Reply::Raw(response_frame(999, "success", json!("stray"))),
            Reply::Success(json!("ran")),
            Reply::Success(json!("ran twice")),
        ]),
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);

    let run = bridge.submit(JobPayload::run_main(None, None));
    let version = bridge.submit(JobPayload::Version);

    assert_eq!(run.wait().await, Ok(json!("ran")));
    assert_eq!(version.wait().await.unwrap()["minor"], 35);
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_frees_the_queue_and_its_late_reply_is_ignored() {
    let fake = FakeSpawner::new(|request| match request["request"].as_str() {
        Some("lsp/hover") => Reply::After(
            Duration::from_secs(8),
            Box::new(Reply::Success(json!({ "contents": "late" }))),
        ),
        _ => default_reply(request),
    });
    let (bridge, _events) = start_bridge(&fake);

    let hover = bridge.submit(JobPayload::Hover {
        uri: MAIN_URI.into(),
        position: Position::new(0, 0),
    });
    let version = bridge.submit(JobPayload::Version);

    match hover.wait().await {
        Err(BridgeError::Timeout { elapsed_ms, .. }) => assert!(elapsed_ms >= 5_000),
        other => panic!("expected timeout, got {other:?}"),
    }
    // The late hover reply arrives first and must not be handed to the version caller.
    assert_eq!(version.wait().await.unwrap()["major"], 0);
}
