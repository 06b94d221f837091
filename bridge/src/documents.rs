//! Open documents and the diagnostics reported for them.
//!
//! Text is recorded when an update is submitted, so by the time a later check
//! reaches the worker the store already holds that text. Diagnostics are
//! replaced wholesale by each successful check and cleared whenever a check is
//! dispatched; a check that fails leaves them cleared.

use std::collections::{BTreeMap, HashMap};

use crate::job::JobPayload;
use crate::types::{BridgeEvent, Diagnostic, DiagnosticsSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentRecord {
    pub text: String,
    pub version: u32,
    /// Changed since the last successful check.
    pub dirty: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DocumentStore {
    documents: BTreeMap<String, DocumentRecord>,
    diagnostics: HashMap<String, Vec<Diagnostic>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the full text of an opened or changed document. Returns its new version.
    pub fn update(&mut self, uri: &str, text: &str) -> u32 {
        let record = self
            .documents
            .entry(uri.to_string())
            .or_insert_with(|| DocumentRecord {
                text: String::new(),
                version: 0,
                dirty: true,
            });
        record.text = text.to_string();
        record.version += 1;
        record.dirty = true;
        record.version
    }

    /// Forget a closed document and its diagnostics.
    pub fn close(&mut self, uri: &str) -> Vec<BridgeEvent> {
        self.documents.remove(uri);
        self.diagnostics.remove(uri);
        vec![BridgeEvent::DiagnosticsCleared {
            uri: uri.to_string(),
        }]
    }

    /// Drop every installed diagnostic; one clear event per affected URI.
    pub fn clear_diagnostics(&mut self) -> Vec<BridgeEvent> {
        let mut uris: Vec<String> = self.diagnostics.drain().map(|(uri, _)| uri).collect();
        uris.sort();
        uris.into_iter()
            .map(|uri| BridgeEvent::DiagnosticsCleared { uri })
            .collect()
    }

    /// Replace all diagnostics with a check's reports.
    ///
    /// Open documents the check didn't mention get an empty set, so the front
    /// end stops showing anything for them.
    pub fn install(&mut self, reports: Vec<(String, Vec<Diagnostic>)>) -> Vec<BridgeEvent> {
        let mut events = self.clear_diagnostics();
        let mut reported: BTreeMap<String, Vec<Diagnostic>> = BTreeMap::new();
        for (uri, items) in reports {
            reported.entry(uri).or_default().extend(items);
        }
        for uri in self.documents.keys() {
            reported.entry(uri.clone()).or_default();
        }

        for (uri, items) in reported {
            if !items.is_empty() {
                self.diagnostics.insert(uri.clone(), items.clone());
            }
            events.push(BridgeEvent::Diagnostics { uri, items });
        }
        for record in self.documents.values_mut() {
            record.dirty = false;
        }
        events
    }

    /// Jobs that rebuild a fresh worker's view: every document, then one check.
    pub fn replay(&self) -> Vec<JobPayload> {
        if self.documents.is_empty() {
            return Vec::new();
        }
        let mut payloads: Vec<JobPayload> = self
            .documents
            .iter()
            .map(|(uri, record)| JobPayload::AddUri {
                uri: uri.clone(),
                src: record.text.clone(),
            })
            .collect();
        payloads.push(JobPayload::Check { uri: None });
        payloads
    }

    #[cfg(test)]
    pub fn get(&self, uri: &str) -> Option<&DocumentRecord> {
        self.documents.get(uri)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(String, Vec<Diagnostic>)> = self
            .diagnostics
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        // Documents with errors first, then by URI
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }
}
