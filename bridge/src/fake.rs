//! In-memory worker for tests.
//!
//! [`FakeSpawner`] hands the bridge one end of a pipe and serves the other end
//! with a scripted handler: every request is recorded, then answered with the
//! handler's [`Reply`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use crate::codec::FrameReader;
use crate::supervisor::Spawner;
use crate::transport::Connection;

const PIPE_CAPACITY: usize = 64 * 1024;

/// What the fake worker does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `{"status":"success","result":…}` under the request's id.
    Success(Value),
    /// `{"status":"failure","result":…}` under the request's id.
    Failure(Value),
    /// Never answer.
    Silent,
    /// Close the channel, as a dying process would.
    Crash,
    /// Write these bytes verbatim.
    Raw(Vec<u8>),
    /// Wait, then reply. The worker handles nothing else meanwhile.
    After(Duration, Box<Reply>),
    Many(Vec<Reply>),
}

/// Answers the way a healthy worker with an empty project would.
#[must_use]
pub fn default_reply(request: &Value) -> Reply {
    match request["request"].as_str() {
        Some("api/version") => Reply::Success(serde_json::json!({
            "major": 0,
            "minor": 35,
            "revision": 0
        })),
        Some("lsp/check") => Reply::Success(serde_json::json!([])),
        _ => Reply::Success(Value::Null),
    }
}

/// Frame a response body by hand, for stray or duplicate replies.
#[must_use]
pub fn response_frame(id: u64, status: &str, result: Value) -> Vec<u8> {
    frame_bytes(&serde_json::json!({ "id": id, "status": status, "result": result }))
}

#[must_use]
pub fn frame_bytes(body: &Value) -> Vec<u8> {
    let body = body.to_string();
    format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
}

enum Step {
    Write(Vec<u8>),
    Sleep(Duration),
    Crash,
}

fn plan(request: &Value, reply: Reply, steps: &mut Vec<Step>) {
    let id = request["id"].as_u64().unwrap_or_default();
    match reply {
        Reply::Success(result) => steps.push(Step::Write(response_frame(id, "success", result))),
        Reply::Failure(result) => steps.push(Step::Write(response_frame(id, "failure", result))),
        Reply::Silent => {}
        Reply::Crash => steps.push(Step::Crash),
        Reply::Raw(bytes) => steps.push(Step::Write(bytes)),
        Reply::After(delay, reply) => {
            steps.push(Step::Sleep(delay));
            plan(request, *reply, steps);
        }
        Reply::Many(replies) => {
            for reply in replies {
                plan(request, reply, steps);
            }
        }
    }
}

type Handler = dyn Fn(&Value) -> Reply + Send + Sync;

#[derive(Default)]
struct FakeState {
    requests: Vec<Value>,
    spawns: usize,
    failing_spawns: usize,
}

/// Spawner whose workers live in-process.
#[derive(Clone)]
pub struct FakeSpawner {
    handler: Arc<Handler>,
    state: Arc<Mutex<FakeState>>,
    received: Arc<Notify>,
}

impl FakeSpawner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            state: Arc::new(Mutex::new(FakeState::default())),
            received: Arc::new(Notify::new()),
        }
    }

    /// A worker that answers everything with [`default_reply`].
    #[must_use]
    pub fn responsive() -> Self {
        Self::new(default_reply)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` spawns fail before any worker exists.
    pub fn fail_next_spawns(&self, count: usize) {
        self.lock().failing_spawns = count;
    }

    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.lock().spawns
    }

    /// Every request received so far, across all spawned workers, probes included.
    #[must_use]
    pub fn requests(&self) -> Vec<Value> {
        self.lock().requests.clone()
    }

    /// Requests other than readiness probes.
    #[must_use]
    pub fn job_requests(&self) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|request| request["id"] != 0)
            .collect()
    }

    /// Wait until at least `count` requests (probes included) have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let notified = self.received.notified();
            if self.lock().requests.len() >= count {
                return;
            }
            notified.await;
        }
    }

    async fn serve(self, worker_end: DuplexStream) {
        let (read, mut write) = tokio::io::split(worker_end);
        let mut reader = FrameReader::new(read);
        while let Ok(Some(body)) = reader.read_frame().await {
            let Ok(request) = serde_json::from_slice::<Value>(&body) else {
                continue;
            };
            self.lock().requests.push(request.clone());
            self.received.notify_waiters();

            let mut steps = Vec::new();
            plan(&request, (self.handler)(&request), &mut steps);
            for step in steps {
                match step {
                    Step::Write(bytes) => {
                        if write.write_all(&bytes).await.is_err() || write.flush().await.is_err() {
                            return;
                        }
                    }
                    Step::Sleep(delay) => tokio::time::sleep(delay).await,
                    Step::Crash => return,
                }
            }
        }
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self) -> impl Future<Output = anyhow::Result<Connection>> + Send {
        let fake = self.clone();
        async move {
            {
                let mut state = fake.lock();
                state.spawns += 1;
                if state.failing_spawns > 0 {
                    state.failing_spawns -= 1;
                    bail!("fake worker refused to spawn");
                }
            }
            let (bridge_end, worker_end) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(fake.serve(worker_end));
            let (read, write) = tokio::io::split(bridge_end);
            Ok(Connection::new(read, write))
        }
    }
}
