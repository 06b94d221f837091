//! Failure outcomes delivered to job callers.

use thiserror::Error;

use crate::job::JobId;

/// Why a job did not produce a result.
///
/// `Clone` so a single crash can fail every outstanding caller with the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The worker never became ready.
    #[error("worker failed to start: {0}")]
    Startup(String),
    /// The channel to the worker closed unexpectedly.
    #[error("worker process crashed: {0}")]
    ProcessCrashed(String),
    /// A malformed frame or an unusable response body.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("job {job_id} timed out after {elapsed_ms}ms")]
    Timeout { job_id: JobId, elapsed_ms: u64 },
    /// A well-formed failure response from the worker.
    #[error("{0}")]
    WorkerReported(String),
    #[error("job was cancelled")]
    Cancelled,
    /// Restart budget exhausted or worker stopped; needs an explicit restart.
    #[error("worker is unavailable")]
    Unavailable,
    #[error("bridge has shut down")]
    ShutDown,
}

impl BridgeError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
