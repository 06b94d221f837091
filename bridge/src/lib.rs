//! Job queue and process bridge between an editor front end and the Flix compiler.
//!
//! [`FlixBridge`] serializes editor requests to a single long-lived worker
//! process, correlates responses by id, tracks open documents and their
//! diagnostics, and restarts the worker when it dies.

pub mod codec;
pub mod error;
pub mod types;

pub(crate) mod correlation;
pub(crate) mod documents;
pub(crate) mod engine;
pub(crate) mod job;
pub(crate) mod protocol;
pub(crate) mod queue;
pub(crate) mod supervisor;
pub(crate) mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

mod bridge;

pub use bridge::{FlixBridge, JobTicket};
pub use error::BridgeError;
pub use job::{JobId, JobKind, JobPayload};
pub use supervisor::{ProcessSpawner, Spawner};
pub use transport::Connection;
pub use types::{
    BridgeConfig, BridgeEvent, ChannelKind, CodeLens, Diagnostic, DiagnosticSeverity,
    DiagnosticsSnapshot, Hover, LensCommand, Location, LocationLink, NotifyLevel, Position,
    ProgressPhase, Range, RestartPolicy, TimeoutConfig, VersionInfo, WorkerConfig, WorkerState,
};
