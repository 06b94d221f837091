//! The actor that owns all queue, correlation, document and worker state.
//!
//! Every mutation happens on this one task, in the order its inputs arrive:
//! facade commands, frames from the worker, the in-flight deadline, the
//! restart timer and the result of a pending start. Nothing else touches the
//! worker channel, so single-flight holds without locks.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::correlation::{CorrelationTable, Resolution};
use crate::documents::DocumentStore;
use crate::error::BridgeError;
use crate::job::{Job, JobId, JobIdAllocator, JobKind, JobPayload, Outcome};
use crate::protocol::{self, Incoming};
use crate::queue::JobQueue;
use crate::supervisor::{self, Spawner, Started};
use crate::transport::{Transport, TransportEvent};
use crate::types::{BridgeConfig, BridgeEvent, DiagnosticsSnapshot, NotifyLevel, WorkerState};

type StartResult = Result<Started, BridgeError>;

/// Requests from the facade.
pub(crate) enum Command {
    Submit(Job),
    Cancel(JobId),
    Restart,
    Snapshot(oneshot::Sender<DiagnosticsSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Everything the engine mutates.
struct EngineState {
    queue: JobQueue,
    table: CorrelationTable,
    documents: DocumentStore,
    worker: Option<Transport>,
    lifecycle: WorkerState,
    startup: Option<JoinHandle<StartResult>>,
    restart_at: Option<Instant>,
    /// Restarts scheduled since a worker last answered a dispatched job.
    failed_restarts: u32,
    /// Re-send open documents once the next worker is ready.
    replay_on_ready: bool,
}

pub(crate) struct Engine<S> {
    spawner: Arc<S>,
    config: BridgeConfig,
    ids: JobIdAllocator,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    state_tx: watch::Sender<WorkerState>,
    state: EngineState,
}

/// Start the engine task. Must be called from within a tokio runtime.
pub(crate) fn spawn<S: Spawner>(
    config: BridgeConfig,
    spawner: S,
    ids: JobIdAllocator,
    events: mpsc::UnboundedSender<BridgeEvent>,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<WorkerState>) {
    let (command_tx, commands) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
    let engine = Engine {
        spawner: Arc::new(spawner),
        config,
        ids,
        commands,
        events,
        state_tx,
        state: EngineState {
            queue: JobQueue::new(),
            table: CorrelationTable::new(),
            documents: DocumentStore::new(),
            worker: None,
            lifecycle: WorkerState::Starting,
            startup: None,
            restart_at: None,
            failed_restarts: 0,
            replay_on_ready: false,
        },
    };
    tokio::spawn(engine.run());
    (command_tx, state_rx)
}

impl<S: Spawner> Engine<S> {
    async fn run(mut self) {
        self.begin_start();
        loop {
            let deadline = self.state.table.next_deadline();
            let restart_at = self.state.restart_at;
            // Commands first: a submit always lands before the next worker event.
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                event = next_event(self.state.worker.as_mut()) => {
                    self.handle_transport_event(event).await;
                }
                () = sleep_until(deadline) => self.expire_jobs().await,
                () = sleep_until(restart_at) => self.begin_start(),
                result = join_startup(&mut self.state.startup) => {
                    self.handle_startup(result).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Submit(job) => self.submit(job).await,
            Command::Cancel(id) => self.cancel(id),
            Command::Restart => self.restart(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.documents.snapshot());
            }
            Command::Shutdown(done) => {
                self.shutdown().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn submit(&mut self, job: Job) {
        match &job.payload {
            JobPayload::AddUri { uri, src } => {
                let version = self.state.documents.update(uri, src);
                tracing::debug!(uri = %uri, version, "Document updated");
            }
            JobPayload::RemUri { uri } => {
                let events = self.state.documents.close(uri);
                self.emit_all(events);
            }
            _ => {}
        }

        if self.state.lifecycle.rejects_jobs() {
            tracing::debug!(job_id = %job.id, kind = %job.kind(), "Worker unavailable, rejecting job");
            self.finish(job, Err(BridgeError::Unavailable));
            return;
        }

        tracing::debug!(
            job_id = %job.id,
            kind = %job.kind(),
            depth = self.state.queue.len(),
            "Job queued"
        );
        self.state.queue.push(job);
        self.dispatch().await;
    }

    fn cancel(&mut self, id: JobId) {
        if let Some(job) = self.state.queue.remove(id) {
            tracing::debug!(job_id = %id, "Cancelled queued job");
            self.finish(job, Err(BridgeError::Cancelled));
        } else if self.state.table.cancel(id) {
            tracing::debug!(job_id = %id, "Cancelled in-flight job; its result will be ignored");
        } else {
            tracing::debug!(job_id = %id, "Nothing to cancel");
        }
    }

    /// Hand queued jobs to the worker while it is up and nothing is in flight.
    async fn dispatch(&mut self) {
        while self.state.lifecycle.is_up() && self.state.table.is_idle() {
            let Some(job) = self.state.queue.pop() else {
                break;
            };
            let frame = match protocol::encode_request(job.id, &job.payload) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, "Could not encode job: {e}");
                    self.finish(job, Err(e));
                    continue;
                }
            };
            if job.kind() == JobKind::Check {
                let cleared = self.state.documents.clear_diagnostics();
                self.emit_all(cleared);
            }

            tracing::debug!(
                job_id = %job.id,
                kind = %job.kind(),
                uri = job.payload.uri(),
                "Dispatching job"
            );
            self.state.table.register(job, Instant::now());
            self.set_state(WorkerState::Busy);

            let sent = match self.state.worker.as_mut() {
                Some(worker) => worker.send(frame).await.is_ok(),
                None => false,
            };
            if !sent {
                self.handle_crash("writer channel closed".to_string());
                return;
            }
        }

        if self.state.lifecycle.is_up() && self.state.table.is_idle() {
            self.set_state(WorkerState::Ready);
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(Incoming::Response { id, outcome }) => {
                self.handle_response(id, outcome);
            }
            TransportEvent::Frame(Incoming::Malformed { id, reason }) => {
                self.handle_malformed(id, reason);
            }
            TransportEvent::Closed(reason) => {
                self.handle_crash(reason);
                return;
            }
        }
        self.dispatch().await;
    }

    fn handle_response(&mut self, id: JobId, outcome: Outcome) {
        let resolution = self.state.table.resolve(id);
        if !matches!(resolution, Resolution::Unknown) {
            self.mark_stable();
        }
        match resolution {
            Resolution::Pending(record) => {
                let outcome = self.apply_effects(record.job.kind(), outcome);
                if record.cancelled {
                    tracing::debug!(job_id = %id, "Response for cancelled job");
                }
                self.finish(record.job, outcome);
            }
            Resolution::Abandoned(kind) => {
                tracing::debug!(job_id = %id, kind = %kind, "Late response for abandoned job");
                if kind == JobKind::Check {
                    let _ = self.apply_effects(kind, outcome);
                }
            }
            Resolution::Unknown => {
                tracing::warn!(job_id = %id, "Dropping response for unknown job");
            }
        }
    }

    fn handle_malformed(&mut self, id: Option<JobId>, reason: String) {
        let Some(id) = id else {
            tracing::warn!("Dropping malformed frame: {reason}");
            return;
        };
        match self.state.table.resolve(id) {
            Resolution::Pending(record) => {
                tracing::warn!(job_id = %id, "Malformed response: {reason}");
                self.finish(record.job, Err(BridgeError::Protocol(reason)));
            }
            Resolution::Abandoned(_) => {
                tracing::debug!(job_id = %id, "Malformed late response: {reason}");
            }
            Resolution::Unknown => {
                tracing::warn!(job_id = %id, "Malformed response for unknown job: {reason}");
            }
        }
    }

    /// State changes that follow a response regardless of who is still waiting.
    fn apply_effects(&mut self, kind: JobKind, outcome: Outcome) -> Outcome {
        if kind != JobKind::Check {
            return outcome;
        }
        match outcome {
            Ok(result) => match protocol::parse_check_result(result.clone()) {
                Ok(reports) => {
                    let events = self.state.documents.install(reports);
                    self.emit_all(events);
                    Ok(result)
                }
                Err(e) => {
                    tracing::warn!("Unusable check result: {e}");
                    Err(e)
                }
            },
            Err(e) => {
                tracing::debug!("Check failed, diagnostics stay cleared: {e}");
                Err(e)
            }
        }
    }

    async fn expire_jobs(&mut self) {
        let now = Instant::now();
        for record in self.state.table.expire(now) {
            let job_id = record.job.id;
            let elapsed_ms = record.elapsed_ms(now);
            tracing::warn!(job_id = %job_id, kind = %record.job.kind(), elapsed_ms, "Job timed out");
            self.finish(record.job, Err(BridgeError::Timeout { job_id, elapsed_ms }));
        }
        self.dispatch().await;
    }

    fn handle_crash(&mut self, reason: String) {
        tracing::error!(reason = %reason, "Worker crashed");
        if let Some(transport) = self.state.worker.take() {
            tokio::spawn(transport.shutdown(std::time::Duration::ZERO));
        }

        let error = BridgeError::ProcessCrashed(reason.clone());
        for record in self.state.table.drain() {
            self.finish(record.job, Err(error.clone()));
        }
        self.fail_queued(&error);

        self.notify(NotifyLevel::Error, format!("Flix worker crashed: {reason}"));
        self.state.replay_on_ready = true;
        self.schedule_restart();
    }

    /// A worker that answered a real job has survived its startup; the restart budget refills.
    fn mark_stable(&mut self) {
        if self.state.failed_restarts > 0 {
            tracing::debug!(restarts = self.state.failed_restarts, "Worker stable, resetting restart budget");
            self.state.failed_restarts = 0;
        }
    }

    /// Back off and restart, or give up once the retry budget is spent.
    fn schedule_restart(&mut self) {
        let policy = self.config.restart;
        if policy.auto && self.state.failed_restarts < policy.max_retries {
            let delay = policy.delay(self.state.failed_restarts);
            self.state.failed_restarts += 1;
            tracing::info!(
                attempt = self.state.failed_restarts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling worker restart"
            );
            self.state.restart_at = Some(Instant::now() + delay);
            self.set_state(WorkerState::Crashed);
        } else {
            tracing::warn!(
                restarts = self.state.failed_restarts,
                "Worker unavailable until restarted"
            );
            self.fail_queued(&BridgeError::Unavailable);
            self.set_state(WorkerState::Unavailable);
            self.notify(
                NotifyLevel::Error,
                "Flix is unavailable. Restart it to continue.".to_string(),
            );
        }
    }

    fn begin_start(&mut self) {
        self.state.restart_at = None;
        self.set_state(WorkerState::Starting);
        let spawner = Arc::clone(&self.spawner);
        let timeouts = self.config.timeouts;
        self.state.startup = Some(tokio::spawn(async move {
            supervisor::start_worker(&*spawner, timeouts).await
        }));
    }

    async fn handle_startup(&mut self, result: StartResult) {
        match result {
            Ok(Started { transport, version }) => {
                self.state.worker = Some(transport);
                if let Some(version) = version {
                    tracing::info!(version = %version, "Worker started");
                    self.notify(NotifyLevel::Info, format!("Running Flix ({version})"));
                }
                if std::mem::take(&mut self.state.replay_on_ready) {
                    let replay: Vec<Job> = self
                        .state
                        .documents
                        .replay()
                        .into_iter()
                        .map(|payload| Job::new(self.ids.allocate(), payload))
                        .collect();
                    tracing::info!(jobs = replay.len(), "Replaying open documents");
                    self.state.queue.push_priority(replay);
                }
                self.set_state(WorkerState::Ready);
                self.dispatch().await;
            }
            Err(e) => {
                tracing::error!("Worker failed to start: {e}");
                self.fail_queued(&e);
                self.notify(NotifyLevel::Error, e.to_string());
                self.schedule_restart();
            }
        }
    }

    /// Explicit restart: cancel what's in flight, keep the queue, start fresh.
    ///
    /// The old worker is stopped in the background so commands keep flowing
    /// during its grace period.
    fn restart(&mut self) {
        tracing::info!("Restarting worker on request");
        if let Some(startup) = self.state.startup.take() {
            startup.abort();
        }
        for record in self.state.table.drain() {
            self.finish(record.job, Err(BridgeError::Cancelled));
        }
        if let Some(transport) = self.state.worker.take() {
            tokio::spawn(supervisor::stop_worker(
                transport,
                self.ids.allocate(),
                self.config.timeouts.shutdown(),
            ));
        }
        self.state.failed_restarts = 0;
        self.state.replay_on_ready = true;
        self.begin_start();
    }

    /// Final stop. Waits out the worker's grace period; no command follows it.
    async fn shutdown(&mut self) {
        tracing::info!("Shutting down bridge");
        if let Some(startup) = self.state.startup.take() {
            startup.abort();
        }
        self.state.restart_at = None;
        for record in self.state.table.drain() {
            self.finish(record.job, Err(BridgeError::ShutDown));
        }
        self.fail_queued(&BridgeError::ShutDown);
        if let Some(transport) = self.state.worker.take() {
            supervisor::stop_worker(transport, self.ids.allocate(), self.config.timeouts.shutdown())
                .await;
        }
        self.set_state(WorkerState::Stopped);
    }

    fn fail_queued(&mut self, error: &BridgeError) {
        let jobs: Vec<Job> = self.state.queue.drain().collect();
        for job in jobs {
            self.finish(job, Err(error.clone()));
        }
    }

    /// Retire a job: resolve its caller (if still waiting) and announce it.
    fn finish(&self, mut job: Job, outcome: Outcome) {
        let ok = outcome.is_ok();
        tracing::debug!(job_id = %job.id, kind = %job.kind(), ok, "Job finished");
        let (id, kind) = (job.id, job.kind());
        job.complete(outcome);
        self.emit(BridgeEvent::JobFinished { id, kind, ok });
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state.lifecycle == state {
            return;
        }
        if state.is_up() && self.state.lifecycle.is_up() {
            tracing::trace!(state = %state, "Worker state changed");
        } else {
            tracing::info!(state = %state, "Worker state changed");
        }
        self.state.lifecycle = state;
        self.state_tx.send_replace(state);
        self.emit(BridgeEvent::WorkerState(state));
    }

    fn notify(&self, level: NotifyLevel, message: String) {
        self.emit(BridgeEvent::Notify { level, message });
    }

    fn emit(&self, event: BridgeEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<BridgeEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

async fn next_event(worker: Option<&mut Transport>) -> TransportEvent {
    match worker {
        Some(worker) => worker.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_startup(startup: &mut Option<JoinHandle<StartResult>>) -> StartResult {
    let Some(handle) = startup.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *startup = None;
    result.unwrap_or_else(|e| Err(BridgeError::Startup(format!("start task failed: {e}"))))
}
