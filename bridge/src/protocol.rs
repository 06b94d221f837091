//! Wire messages exchanged with the worker.
//!
//! Requests are `{"id", "request", ...payload}`; responses are
//! `{"id", "status": "success"|"failure", "result"}`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::BridgeError;
use crate::job::{JobId, JobPayload};
use crate::types::{Diagnostic, DiagnosticSeverity, Location, LocationLink, Range};

/// Source attributed to diagnostics that don't name one.
const DEFAULT_SOURCE: &str = "flix";

/// Build the request frame for `payload` under correlation id `id`.
pub(crate) fn encode_request(id: JobId, payload: &JobPayload) -> Result<Value, BridgeError> {
    let mut value = serde_json::to_value(payload)
        .map_err(|e| BridgeError::Protocol(format!("serializing {}: {e}", payload.kind())))?;
    match value.as_object_mut() {
        Some(fields) => {
            fields.insert("id".to_string(), Value::from(id.get()));
            Ok(value)
        }
        None => Err(BridgeError::Protocol(format!(
            "{} did not serialize to an object",
            payload.kind()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Success,
    Failure,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    id: JobId,
    status: Status,
    #[serde(default)]
    result: Value,
}

/// One decoded frame from the worker.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response {
        id: JobId,
        outcome: Result<Value, BridgeError>,
    },
    /// Framing was fine but the body wasn't a usable response.
    Malformed { id: Option<JobId>, reason: String },
}

pub(crate) fn decode_response(body: &[u8]) -> Incoming {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            return Incoming::Malformed {
                id: None,
                reason: format!("frame body is not JSON: {e}"),
            };
        }
    };

    let id = value.get("id").and_then(Value::as_u64).map(JobId::new);
    match serde_json::from_value::<RawResponse>(value) {
        Ok(raw) => Incoming::Response {
            id: raw.id,
            outcome: match raw.status {
                Status::Success => Ok(raw.result),
                Status::Failure => Err(BridgeError::WorkerReported(failure_message(&raw.result))),
            },
        },
        Err(e) => Incoming::Malformed {
            id,
            reason: format!("invalid response: {e}"),
        },
    }
}

/// Human-readable message from a failure body.
fn failure_message(result: &Value) -> String {
    match result {
        Value::String(message) => message.clone(),
        Value::Null => "worker reported a failure".to_string(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_string),
    }
}

#[derive(Debug, Deserialize)]
struct WireDiagnostics {
    uri: String,
    #[serde(default)]
    diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
struct WireDiagnostic {
    range: Range,
    severity: Option<u64>,
    source: Option<String>,
    code: Option<Value>,
    message: String,
}

impl WireDiagnostic {
    fn into_diagnostic(self) -> Diagnostic {
        let code = match self.code {
            Some(Value::String(code)) => Some(code),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => None,
        };
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Error),
            self.message,
            self.range,
            self.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            code,
        )
    }
}

/// Per-document diagnostics from a successful `lsp/check`. `null` means none.
pub(crate) fn parse_check_result(result: Value) -> Result<Vec<(String, Vec<Diagnostic>)>, BridgeError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    let reports: Vec<WireDiagnostics> = serde_json::from_value(result)
        .map_err(|e| BridgeError::Protocol(format!("invalid check result: {e}")))?;
    Ok(reports
        .into_iter()
        .map(|report| {
            let items = report
                .diagnostics
                .into_iter()
                .map(WireDiagnostic::into_diagnostic)
                .collect();
            (report.uri, items)
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DefinitionTarget {
    Link(LocationLink),
    Plain(Location),
}

/// `lsp/goto` result: one or many locations or links.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Definitions {
    Many(Vec<DefinitionTarget>),
    One(DefinitionTarget),
}

impl Definitions {
    pub fn into_locations(self) -> Vec<Location> {
        let targets = match self {
            Self::Many(targets) => targets,
            Self::One(target) => vec![target],
        };
        targets
            .into_iter()
            .map(|target| match target {
                DefinitionTarget::Link(link) => link.into(),
                DefinitionTarget::Plain(location) => location,
            })
            .collect()
    }
}
