//! Jobs: the unit of work submitted to the worker.
//!
//! A job's kind is a closed enum matched exhaustively at the queue and wire
//! boundaries. The payload serializes straight into the request frame body.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::types::Position;

/// Correlation identity of a job, allocated at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Reserved for the supervisor's readiness probe; never handed to callers.
    pub(crate) const PROBE: JobId = JobId(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out correlation ids. Clones share one counter.
#[derive(Debug, Clone)]
pub(crate) struct JobIdAllocator(Arc<AtomicU64>);

impl JobIdAllocator {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn allocate(&self) -> JobId {
        JobId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    AddUri,
    RemUri,
    Check,
    Goto,
    Hover,
    Uses,
    Codelens,
    RunMain,
    RunTests,
    RunBenchmarks,
    Version,
    /// Internal control: asks the worker to exit.
    Shutdown,
}

impl JobKind {
    /// The `request` tag used on the wire.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::AddUri => "api/addUri",
            Self::RemUri => "api/remUri",
            Self::Check => "lsp/check",
            Self::Goto => "lsp/goto",
            Self::Hover => "lsp/hover",
            Self::Uses => "lsp/uses",
            Self::Codelens => "lsp/codelens",
            Self::RunMain => "cmd/runMain",
            Self::RunTests => "cmd/runTests",
            Self::RunBenchmarks => "cmd/runBenchmarks",
            Self::Version => "api/version",
            Self::Shutdown => "api/shutdown",
        }
    }

    /// Read-only lookups. These carry the per-job query timeout.
    #[must_use]
    pub const fn is_query(self) -> bool {
        matches!(
            self,
            Self::Goto | Self::Hover | Self::Uses | Self::Codelens | Self::Version
        )
    }

    /// Failures of these kinds are surfaced to the user, not just swallowed.
    #[must_use]
    pub const fn reports_failures(self) -> bool {
        matches!(
            self,
            Self::RunMain | Self::RunTests | Self::RunBenchmarks | Self::Version
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Request body. The serde tag doubles as the wire `request` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request")]
pub enum JobPayload {
    #[serde(rename = "api/addUri")]
    AddUri { uri: String, src: String },
    #[serde(rename = "api/remUri")]
    RemUri { uri: String },
    #[serde(rename = "lsp/check")]
    Check {
        #[serde(skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
    #[serde(rename = "lsp/goto")]
    Goto { uri: String, position: Position },
    #[serde(rename = "lsp/hover")]
    Hover { uri: String, position: Position },
    #[serde(rename = "lsp/uses")]
    Uses { uri: String, position: Position },
    #[serde(rename = "lsp/codelens")]
    Codelens { uri: String },
    #[serde(rename = "cmd/runMain")]
    RunMain {
        #[serde(rename = "entryPoint", skip_serializing_if = "Option::is_none")]
        entry_point: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<String>,
    },
    #[serde(rename = "cmd/runTests")]
    RunTests {
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    #[serde(rename = "cmd/runBenchmarks")]
    RunBenchmarks,
    #[serde(rename = "api/version")]
    Version,
    /// Sent by the bridge itself when stopping a worker. Callers can't queue it.
    #[serde(rename = "api/shutdown")]
    Shutdown,
}

impl JobPayload {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::AddUri { .. } => JobKind::AddUri,
            Self::RemUri { .. } => JobKind::RemUri,
            Self::Check { .. } => JobKind::Check,
            Self::Goto { .. } => JobKind::Goto,
            Self::Hover { .. } => JobKind::Hover,
            Self::Uses { .. } => JobKind::Uses,
            Self::Codelens { .. } => JobKind::Codelens,
            Self::RunMain { .. } => JobKind::RunMain,
            Self::RunTests { .. } => JobKind::RunTests,
            Self::RunBenchmarks => JobKind::RunBenchmarks,
            Self::Version => JobKind::Version,
            Self::Shutdown => JobKind::Shutdown,
        }
    }

    /// Document the job is about, if any.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::AddUri { uri, .. }
            | Self::RemUri { uri }
            | Self::Goto { uri, .. }
            | Self::Hover { uri, .. }
            | Self::Uses { uri, .. }
            | Self::Codelens { uri } => Some(uri),
            Self::Check { uri } => uri.as_deref(),
            Self::RunMain { .. }
            | Self::RunTests { .. }
            | Self::RunBenchmarks
            | Self::Version
            | Self::Shutdown => None,
        }
    }

    /// Build a `cmd/runMain` payload. Blank entry points and arguments are omitted.
    #[must_use]
    pub fn run_main(entry_point: Option<&str>, args: Option<&str>) -> Self {
        let non_blank = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self::RunMain {
            entry_point: non_blank(entry_point),
            args: args.filter(|a| !a.trim().is_empty()).map(str::to_string),
        }
    }

    /// Build a `cmd/runTests` payload; test names are joined by a single space.
    #[must_use]
    pub fn run_tests<S: AsRef<str>>(names: &[S]) -> Self {
        let filter = names
            .iter()
            .map(|name| name.as_ref().trim())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self::RunTests {
            filter: (!filter.is_empty()).then_some(filter),
        }
    }
}

pub(crate) type Outcome = Result<serde_json::Value, BridgeError>;
pub(crate) type Completion = oneshot::Sender<Outcome>;

/// A job owned by the queue from enqueue until completion or cancellation.
#[derive(Debug)]
pub(crate) struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub timeout: Option<Duration>,
    completion: Option<Completion>,
}

impl Job {
    pub fn new(id: JobId, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            timeout: None,
            completion: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Whether anyone is still waiting on this job.
    pub fn has_waiter(&self) -> bool {
        self.completion.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver the outcome to the waiting caller. Later calls are no-ops.
    pub fn complete(&mut self, outcome: Outcome) {
        if let Some(tx) = self.completion.take() {
            // The caller may have stopped waiting (progress timeout); that's fine.
            let _ = tx.send(outcome);
        }
    }
}
