//! FlixBridge facade: the public API consumed by the editor front end.
//!
//! Construction starts the engine and the first worker. Notify operations
//! return immediately. Request operations resolve when the worker answers,
//! the job times out, or the worker goes away. Read-only queries collapse
//! every failure into "nothing to show".

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::engine::{self, Command};
use crate::error::BridgeError;
use crate::job::{Job, JobId, JobIdAllocator, JobKind, JobPayload, Outcome};
use crate::protocol::Definitions;
use crate::supervisor::{ProcessSpawner, Spawner};
use crate::types::{
    BridgeConfig, BridgeEvent, CodeLens, DiagnosticsSnapshot, Hover, Location, NotifyLevel,
    Position, ProgressPhase, TimeoutConfig, VersionInfo, WorkerState,
};

/// A submitted job the caller can wait on or cancel.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    kind: JobKind,
    completion: oneshot::Receiver<Outcome>,
}

impl JobTicket {
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Wait for the outcome. A bridge that went away reports `ShutDown`.
    pub async fn wait(self) -> Result<Value, BridgeError> {
        self.completion.await.unwrap_or(Err(BridgeError::ShutDown))
    }
}

/// Public facade for the job queue and the worker behind it.
///
/// Cheap to clone; clones share one engine. The engine shuts down once every
/// clone is dropped or [`FlixBridge::shutdown`] is called.
#[derive(Clone)]
pub struct FlixBridge {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<WorkerState>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    ids: JobIdAllocator,
    timeouts: TimeoutConfig,
}

impl FlixBridge {
    /// Start the bridge with the configured worker process.
    ///
    /// Must be called from within a tokio runtime. The worker starts in the
    /// background; jobs submitted meanwhile wait in the queue.
    #[must_use]
    pub fn start(config: BridgeConfig) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let spawner = ProcessSpawner::new(&config);
        Self::with_spawner(config, spawner)
    }

    /// Start the bridge with a custom way of producing workers.
    #[must_use]
    pub fn with_spawner<S: Spawner>(
        config: BridgeConfig,
        spawner: S,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let ids = JobIdAllocator::new();
        let timeouts = config.timeouts;
        let (commands, state) = engine::spawn(config, spawner, ids.clone(), event_tx.clone());
        let bridge = Self {
            commands,
            state,
            events: event_tx,
            ids,
            timeouts,
        };
        (bridge, event_rx)
    }

    /// Submit any job. Queries get the configured query timeout; other jobs wait indefinitely.
    ///
    /// `api/shutdown` is internal and fails with a protocol error; use [`FlixBridge::shutdown`].
    pub fn submit(&self, payload: JobPayload) -> JobTicket {
        let kind = payload.kind();
        let timeout = if kind.is_query() {
            self.timeouts.query()
        } else {
            None
        };
        let (tx, rx) = oneshot::channel();
        let id = self.ids.allocate();
        if kind == JobKind::Shutdown {
            tracing::warn!(job_id = %id, "Refusing to queue {kind} from a caller");
            let _ = tx.send(Err(BridgeError::Protocol(format!(
                "{kind} is reserved for stopping the worker"
            ))));
            return JobTicket {
                id,
                kind,
                completion: rx,
            };
        }
        let job = Job::new(id, payload)
            .with_timeout(timeout)
            .with_completion(tx);
        // A closed channel drops the job, and its ticket then reports ShutDown.
        let _ = self.commands.send(Command::Submit(job));
        JobTicket {
            id,
            kind,
            completion: rx,
        }
    }

    /// Submit a job and decode its result as `T`.
    pub async fn request<T: DeserializeOwned>(&self, payload: JobPayload) -> Result<T, BridgeError> {
        let kind = payload.kind();
        let value = self.submit(payload).wait().await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("unexpected {kind} result: {e}")))
    }

    fn notify_job(&self, payload: JobPayload) {
        let job = Job::new(self.ids.allocate(), payload);
        let _ = self.commands.send(Command::Submit(job));
    }

    /// The editor opened or changed a document. Sends the full text, then checks it.
    pub fn add_document(&self, uri: &str, text: &str) {
        self.notify_job(JobPayload::AddUri {
            uri: uri.to_string(),
            src: text.to_string(),
        });
        self.notify_job(JobPayload::Check {
            uri: Some(uri.to_string()),
        });
    }

    /// The editor closed a document.
    pub fn remove_document(&self, uri: &str) {
        self.notify_job(JobPayload::RemUri {
            uri: uri.to_string(),
        });
    }

    /// Re-check everything the worker knows about.
    pub fn check(&self) {
        self.notify_job(JobPayload::Check { uri: None });
    }

    pub async fn hover(&self, uri: &str, position: Position) -> Option<Hover> {
        let payload = JobPayload::Hover {
            uri: uri.to_string(),
            position,
        };
        self.query::<Option<Hover>>(payload).await.flatten()
    }

    pub async fn goto_definition(&self, uri: &str, position: Position) -> Vec<Location> {
        let payload = JobPayload::Goto {
            uri: uri.to_string(),
            position,
        };
        self.query::<Option<Definitions>>(payload)
            .await
            .flatten()
            .map(Definitions::into_locations)
            .unwrap_or_default()
    }

    pub async fn find_references(&self, uri: &str, position: Position) -> Vec<Location> {
        let payload = JobPayload::Uses {
            uri: uri.to_string(),
            position,
        };
        self.query::<Option<Vec<Location>>>(payload)
            .await
            .flatten()
            .unwrap_or_default()
    }

    pub async fn codelens(&self, uri: &str) -> Vec<CodeLens> {
        let payload = JobPayload::Codelens {
            uri: uri.to_string(),
        };
        self.query::<Option<Vec<CodeLens>>>(payload)
            .await
            .flatten()
            .unwrap_or_default()
    }

    /// Request whose failure simply means "nothing to show".
    async fn query<T: DeserializeOwned>(&self, payload: JobPayload) -> Option<T> {
        let kind = payload.kind();
        match self.request::<T>(payload).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(kind = %kind, "Query produced no result: {e}");
                None
            }
        }
    }

    /// Ask the worker for its version and announce it.
    pub async fn version(&self) -> Option<VersionInfo> {
        match self.request::<VersionInfo>(JobPayload::Version).await {
            Ok(version) => {
                self.notify(NotifyLevel::Info, format!("Running Flix ({version})"));
                Some(version)
            }
            Err(e) => {
                tracing::warn!("Version query failed: {e}");
                self.notify(NotifyLevel::Error, "Failed starting Flix".to_string());
                None
            }
        }
    }

    pub async fn run_main(
        &self,
        entry_point: Option<&str>,
        args: Option<&str>,
    ) -> Result<Value, BridgeError> {
        self.run_command("Running main", JobPayload::run_main(entry_point, args))
            .await
    }

    /// Run the named tests, or every test when `names` is empty.
    pub async fn run_tests<S: AsRef<str>>(&self, names: &[S]) -> Result<Value, BridgeError> {
        self.run_command("Running tests", JobPayload::run_tests(names))
            .await
    }

    pub async fn run_benchmarks(&self) -> Result<Value, BridgeError> {
        self.run_command("Running benchmarks", JobPayload::RunBenchmarks)
            .await
    }

    async fn run_command(&self, title: &str, payload: JobPayload) -> Result<Value, BridgeError> {
        let ticket = self.submit(payload);
        let kind = ticket.kind();
        let result = self
            .with_progress(title, ticket, self.timeouts.progress())
            .await;
        if let Err(e) = &result
            && kind.reports_failures()
        {
            self.notify(NotifyLevel::Error, format!("{title} failed: {e}"));
        }
        result
    }

    /// Wait for `ticket` behind a progress indicator, giving up after `wait`.
    ///
    /// Giving up doesn't retract the job. It stays queued or in flight and its
    /// result goes unobserved.
    pub async fn with_progress(
        &self,
        title: &str,
        ticket: JobTicket,
        wait: Duration,
    ) -> Result<Value, BridgeError> {
        let job_id = ticket.id();
        self.progress(title, ProgressPhase::Started);
        match tokio::time::timeout(wait, ticket.wait()).await {
            Ok(result) => {
                self.progress(title, ProgressPhase::Finished);
                result
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, "Stopped waiting for job after {}s", wait.as_secs());
                self.progress(title, ProgressPhase::TimedOut);
                Err(BridgeError::Timeout {
                    job_id,
                    elapsed_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Cancel a queued job, or ignore the result of one already in flight.
    pub fn cancel(&self, id: JobId) {
        let _ = self.commands.send(Command::Cancel(id));
    }

    /// Replace the worker with a fresh one. Also leaves the unavailable state.
    pub fn restart(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Subscribe to worker state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Get an immutable snapshot of all diagnostics.
    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return DiagnosticsSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Fail everything outstanding, stop the worker and end the engine.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn notify(&self, level: NotifyLevel, message: String) {
        let _ = self.events.send(BridgeEvent::Notify { level, message });
    }

    fn progress(&self, title: &str, phase: ProgressPhase) {
        let _ = self.events.send(BridgeEvent::Progress {
            title: title.to_string(),
            phase,
        });
    }
}
