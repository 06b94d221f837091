//! Public types shared with the editor front end.
//!
//! The front end builds a [`BridgeConfig`], receives [`BridgeEvent`]s and
//! reads [`DiagnosticsSnapshot`]s. Query results mirror the LSP shapes the
//! worker produces.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobKind};

/// Configuration for the bridge and the worker it supervises.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    pub timeouts: TimeoutConfig,
    pub restart: RestartPolicy,
}

/// How to launch the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable, resolved through `PATH` (e.g. "java").
    pub program: String,
    /// Worker artifact passed as `-jar <jar>`. Must already exist on disk.
    pub jar: Option<PathBuf>,
    /// Runtime arguments placed before `-jar`.
    pub jvm_args: Vec<String>,
    pub channel: ChannelKind,
    /// Flags that put the worker in server mode. TCP appends the chosen port.
    pub server_args: Vec<String>,
    /// Appended verbatim after everything else. Never interpreted.
    pub extra_args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            jar: None,
            jvm_args: Vec::new(),
            channel: ChannelKind::Stdio,
            server_args: vec!["--lsp".to_string()],
            extra_args: Vec::new(),
        }
    }
}

/// Local channel used to talk to the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Frames over the child's stdin/stdout.
    #[default]
    Stdio,
    /// Frames over a loopback TCP socket the worker listens on.
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-attempt wait for the readiness probe.
    pub startup_secs: u64,
    /// Per-job timeout for read-only queries. 0 disables.
    pub query_secs: u64,
    /// Default wait for progress-with-timeout operations.
    pub progress_secs: u64,
    /// Grace period before a stopping worker is killed.
    pub shutdown_secs: u64,
    /// Spawn + probe attempts per start.
    pub start_attempts: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_secs: 30,
            query_secs: 30,
            progress_secs: 180,
            shutdown_secs: 2,
            start_attempts: 3,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    #[must_use]
    pub fn query(&self) -> Option<Duration> {
        (self.query_secs > 0).then(|| Duration::from_secs(self.query_secs))
    }

    #[must_use]
    pub fn progress(&self) -> Duration {
        Duration::from_secs(self.progress_secs)
    }

    #[must_use]
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

/// Crash-restart policy: capped exponential backoff with a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Restart automatically after a crash. Otherwise the worker goes unavailable.
    pub auto: bool,
    /// Consecutive failed restarts before giving up.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto: true,
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RestartPolicy {
    /// Backoff before restart number `attempt` (0-based): `initial * 2^attempt`, capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Lifecycle of the worker process as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    /// Ready, with one job in flight.
    Busy,
    /// Channel lost; a restart may be pending.
    Crashed,
    /// Restart budget exhausted. Only an explicit restart leaves this state.
    Unavailable,
    Stopped,
}

impl WorkerState {
    /// Whether jobs can be dispatched (possibly after the current one).
    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether new jobs are refused outright.
    #[must_use]
    pub fn rejects_jobs(self) -> bool {
        matches!(self, Self::Unavailable | Self::Stopped)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
            Self::Unavailable => "unavailable",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationLink {
    #[serde(default)]
    pub origin_selection_range: Option<Range>,
    pub target_uri: String,
    pub target_range: Range,
    pub target_selection_range: Range,
}

impl From<LocationLink> for Location {
    fn from(link: LocationLink) -> Self {
        Self {
            uri: link.target_uri,
            range: link.target_selection_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Hover {
    /// Markup as sent by the worker (string, `MarkupContent` or marked strings).
    pub contents: serde_json::Value,
    #[serde(default)]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CodeLens {
    pub range: Range,
    #[serde(default)]
    pub command: Option<LensCommand>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LensCommand {
    pub title: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
}

/// Worker version reported by `api/version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}-rev{}", self.major, self.minor, self.revision)
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single problem report from a check.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    range: Range,
    /// Resolved to a concrete string at the boundary ("flix" when absent).
    source: String,
    code: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        range: Range,
        source: String,
        code: Option<String>,
    ) -> Self {
        Self {
            severity,
            message,
            range,
            source,
            code,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Format as `location:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_location(&self, location: &str) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            location,
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Started,
    Finished,
    /// The wait was abandoned; the job may still finish later, unobserved.
    TimedOut,
}

/// Outbound signal for the editor front end.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Replace the diagnostics shown for `uri`.
    Diagnostics { uri: String, items: Vec<Diagnostic> },
    /// Remove every diagnostic shown for `uri`.
    DiagnosticsCleared { uri: String },
    /// User-visible, non-blocking message.
    Notify { level: NotifyLevel, message: String },
    /// A job left the bridge, successfully or not.
    JobFinished { id: JobId, kind: JobKind, ok: bool },
    Progress { title: String, phase: ProgressPhase },
    WorkerState(WorkerState),
}

/// Immutable snapshot of all diagnostics, suitable for UI rendering.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, sorted with error-containing documents first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(String, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn for_uri(&self, uri: &str) -> Option<&[Diagnostic]> {
        self.files
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, items)| items.as_slice())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(line: u32, character: u32) -> Range {
        Range {
            start: Position::new(line, character),
            end: Position::new(line, character + 1),
        }
    }

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(severity, msg.to_string(), range(10, 5), "flix".into(), None)
    }

    #[test]
    fn test_from_lsp_known_and_unknown_values() {
        assert_eq!(
            DiagnosticSeverity::from_lsp(1),
            Some(DiagnosticSeverity::Error)
        );
        assert_eq!(
            DiagnosticSeverity::from_lsp(4),
            Some(DiagnosticSeverity::Hint)
        );
        assert_eq!(DiagnosticSeverity::from_lsp(0), None);
        assert_eq!(DiagnosticSeverity::from_lsp(99), None);
    }

    #[test]
    fn test_display_with_location_is_one_indexed() {
        let diag = Diagnostic::new(
            DiagnosticSeverity::Error,
            "Unresolved reference 'x'.".into(),
            range(10, 5),
            "flix".into(),
            Some("E1234".into()),
        );
        assert_eq!(
            diag.display_with_location("src/Main.flix"),
            "src/Main.flix:11:6: error: [flix] Unresolved reference 'x'."
        );
        assert_eq!(diag.code(), Some("E1234"));
    }

    #[test]
    fn test_snapshot_counts_and_status() {
        let snap = DiagnosticsSnapshot::new(vec![(
            "file:///a.flix".into(),
            vec![
                make_diag(DiagnosticSeverity::Error, "e1"),
                make_diag(DiagnosticSeverity::Error, "e2"),
                make_diag(DiagnosticSeverity::Warning, "w1"),
                make_diag(DiagnosticSeverity::Hint, "h1"),
            ],
        )]);
        assert_eq!(snap.total_count(), 4);
        assert_eq!(snap.error_count(), 2);
        assert_eq!(snap.warning_count(), 1);
        assert_eq!(snap.status_string(), "E:2 W:1");
        assert_eq!(snap.for_uri("file:///a.flix").map(<[_]>::len), Some(4));
        assert!(snap.for_uri("file:///b.flix").is_none());
    }

    #[test]
    fn test_snapshot_default_is_empty() {
        let snap = DiagnosticsSnapshot::default();
        assert!(snap.is_empty());
        assert_eq!(snap.status_string(), "");
    }

    #[test]
    fn test_restart_delay_is_capped_exponential() {
        let policy = RestartPolicy {
            auto: true,
            max_retries: 10,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay(4), Duration::from_millis(8_000));
        assert_eq!(policy.delay(40), Duration::from_millis(8_000));
    }

    #[test]
    fn test_bridge_config_defaults() {
        let config: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.worker.program, "java");
        assert_eq!(config.worker.channel, ChannelKind::Stdio);
        assert_eq!(config.worker.server_args, vec!["--lsp"]);
        assert_eq!(config.timeouts.progress(), Duration::from_secs(180));
        assert_eq!(config.timeouts.query(), Some(Duration::from_secs(30)));
        assert!(config.restart.auto);
    }

    #[test]
    fn test_zero_query_timeout_disables_it() {
        let config: TimeoutConfig = serde_json::from_str(r#"{ "query_secs": 0 }"#).unwrap();
        assert_eq!(config.query(), None);
        assert_eq!(config.startup_secs, 30);
    }

    #[test]
    fn test_worker_config_partial_override() {
        let config: WorkerConfig = serde_json::from_value(serde_json::json!({
            "jar": "/opt/flix/flix.jar",
            "channel": "tcp",
            "extra_args": ["--explain"]
        }))
        .unwrap();
        assert_eq!(config.program, "java");
        assert_eq!(config.jar, Some(PathBuf::from("/opt/flix/flix.jar")));
        assert_eq!(config.channel, ChannelKind::Tcp);
        assert_eq!(config.extra_args, vec!["--explain"]);
    }

    #[test]
    fn test_location_link_converts_to_target_selection() {
        let link: LocationLink = serde_json::from_value(serde_json::json!({
            "targetUri": "file:///b.flix",
            "targetRange": { "start": { "line": 1, "character": 0 }, "end": { "line": 4, "character": 1 } },
            "targetSelectionRange": { "start": { "line": 1, "character": 4 }, "end": { "line": 1, "character": 8 } }
        }))
        .unwrap();
        let location = Location::from(link);
        assert_eq!(location.uri, "file:///b.flix");
        assert_eq!(location.range.start, Position::new(1, 4));
    }

    #[test]
    fn test_version_display() {
        let version = VersionInfo {
            major: 0,
            minor: 35,
            revision: 2,
        };
        assert_eq!(version.to_string(), "0.35-rev2");
    }

    #[test]
    fn test_worker_state_predicates() {
        assert!(WorkerState::Busy.is_up());
        assert!(!WorkerState::Starting.is_up());
        assert!(WorkerState::Unavailable.rejects_jobs());
        assert!(!WorkerState::Crashed.rejects_jobs());
    }
}
