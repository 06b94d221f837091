//! In-flight job records keyed by correlation id.
//!
//! Every response from the worker is matched here. Ids whose caller gave up
//! (timeout) are remembered for a while so a late response can still apply
//! its side effects; anything else unmatched is a stray.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;

use crate::error::BridgeError;
use crate::job::{Job, JobId, JobKind};

/// How many abandoned ids are remembered for late responses.
const ABANDONED_MEMORY: usize = 64;

/// A dispatched job waiting for its response.
#[derive(Debug)]
pub(crate) struct PendingRecord {
    pub job: Job,
    pub dispatched_at: Instant,
    pub deadline: Option<Instant>,
    /// The caller was already told `Cancelled`; the response only drives side effects.
    pub cancelled: bool,
}

impl PendingRecord {
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.dispatched_at).as_millis() as u64
    }
}

/// What a response id matched.
#[derive(Debug)]
pub(crate) enum Resolution {
    Pending(PendingRecord),
    /// The caller already got a timeout; the kind tells which side effects still apply.
    Abandoned(JobKind),
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct CorrelationTable {
    live: HashMap<JobId, PendingRecord>,
    abandoned: VecDeque<(JobId, JobKind)>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Record `job` as dispatched at `now`, arming its timeout if it has one.
    pub fn register(&mut self, job: Job, now: Instant) {
        let deadline = job.timeout.map(|timeout| now + timeout);
        let id = job.id;
        let record = PendingRecord {
            job,
            dispatched_at: now,
            deadline,
            cancelled: false,
        };
        if self.live.insert(id, record).is_some() {
            tracing::warn!(job_id = %id, "Correlation id registered twice");
        }
    }

    /// Match a response id. Each live id resolves at most once.
    pub fn resolve(&mut self, id: JobId) -> Resolution {
        if let Some(record) = self.live.remove(&id) {
            return Resolution::Pending(record);
        }
        match self.abandoned.iter().position(|(abandoned, _)| *abandoned == id) {
            Some(index) => self
                .abandoned
                .remove(index)
                .map_or(Resolution::Unknown, |(_, kind)| Resolution::Abandoned(kind)),
            None => Resolution::Unknown,
        }
    }

    /// Tell an in-flight job's caller it was cancelled. The record stays until
    /// its response or deadline retires it.
    pub fn cancel(&mut self, id: JobId) -> bool {
        match self.live.get_mut(&id) {
            Some(record) => {
                record.cancelled = true;
                record.job.complete(Err(BridgeError::Cancelled));
                true
            }
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.live.values().filter_map(|record| record.deadline).min()
    }

    /// Retire every record whose deadline has passed. Their ids are remembered
    /// so a late response is recognised.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRecord> {
        let expired_ids: Vec<JobId> = self
            .live
            .iter()
            .filter(|(_, record)| record.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(record) = self.live.remove(&id) {
                self.remember_abandoned(id, record.job.kind());
                expired.push(record);
            }
        }
        expired
    }

    /// Take every live record. Used when the channel they were sent on is gone,
    /// so nothing is remembered.
    pub fn drain(&mut self) -> Vec<PendingRecord> {
        self.abandoned.clear();
        self.live.drain().map(|(_, record)| record).collect()
    }

    fn remember_abandoned(&mut self, id: JobId, kind: JobKind) {
        if self.abandoned.len() == ABANDONED_MEMORY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back((id, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn job(id: u64, timeout_ms: Option<u64>) -> Job {
        Job::new(JobId::new(id), JobPayload::Version)
            .with_timeout(timeout_ms.map(Duration::from_millis))
    }

    #[test]
    fn test_resolve_removes_entry_once() {
        let mut table = CorrelationTable::new();
        table.register(job(1, None), Instant::now());
        assert!(!table.is_idle());

        assert!(matches!(
            table.resolve(JobId::new(1)),
            Resolution::Pending(record) if record.job.id == JobId::new(1)
        ));
        assert!(table.is_idle());
        assert!(matches!(table.resolve(JobId::new(1)), Resolution::Unknown));
    }

    #[test]
    fn test_unknown_id_does_not_disturb_live_entries() {
        let mut table = CorrelationTable::new();
        table.register(job(1, None), Instant::now());
        assert!(matches!(table.resolve(JobId::new(99)), Resolution::Unknown));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expire_only_past_deadlines_and_remembers_them() {
        let start = Instant::now();
        let mut table = CorrelationTable::new();
        table.register(job(1, Some(100)), start);
        table.register(job(2, Some(500)), start);
        table.register(job(3, None), start);
        assert_eq!(table.next_deadline(), Some(start + Duration::from_millis(100)));

        let expired = table.expire(start + Duration::from_millis(150));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].job.id, JobId::new(1));
        assert_eq!(expired[0].elapsed_ms(start + Duration::from_millis(150)), 150);
        assert_eq!(table.len(), 2);

        // The late response is recognised exactly once.
        assert!(matches!(
            table.resolve(JobId::new(1)),
            Resolution::Abandoned(JobKind::Version)
        ));
        assert!(matches!(table.resolve(JobId::new(1)), Resolution::Unknown));
    }

    #[test]
    fn test_abandoned_memory_is_bounded() {
        let start = Instant::now();
        let mut table = CorrelationTable::new();
        for id in 1..=(ABANDONED_MEMORY as u64 + 1) {
            table.register(job(id, Some(1)), start);
            table.expire(start + Duration::from_millis(1));
        }
        assert!(matches!(table.resolve(JobId::new(1)), Resolution::Unknown));
        assert!(matches!(
            table.resolve(JobId::new(2)),
            Resolution::Abandoned(_)
        ));
    }

    #[test]
    fn test_cancel_resolves_caller_but_keeps_record() {
        let (tx, mut rx) = oneshot::channel();
        let mut table = CorrelationTable::new();
        table.register(job(7, None).with_completion(tx), Instant::now());

        assert!(table.cancel(JobId::new(7)));
        assert_eq!(rx.try_recv().unwrap(), Err(BridgeError::Cancelled));
        assert!(!table.is_idle());

        match table.resolve(JobId::new(7)) {
            Resolution::Pending(record) => assert!(record.cancelled),
            other => panic!("expected pending record, got {other:?}"),
        }
        assert!(!table.cancel(JobId::new(7)));
    }

    #[test]
    fn test_drain_takes_everything() {
        let mut table = CorrelationTable::new();
        table.register(job(1, None), Instant::now());
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_idle());
        assert_eq!(table.next_deadline(), None);
    }
}
