// hospital-messaging-core/src/pending.rs
//! Outstanding requests of one requester.
//!
//! An id enters the set right before its request is published and leaves it
//! exactly once: when the first reply carrying it arrives, or when an expiry
//! sweep declares it orphaned. Anything else that shows up with the id is
//! [`ReplyOutcome::Unknown`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::routing::Specialization;
use crate::CorrelationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub subject: String,
    pub kind: Specialization,
    pub issued_at: Instant,
}

/// Classification of an incoming reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// First reply for an id this requester was waiting on.
    Retired(PendingEntry),
    /// Duplicate, stale, or addressed to another requester.
    Unknown,
}

impl ReplyOutcome {
    pub fn is_retired(&self) -> bool {
        matches!(self, ReplyOutcome::Retired(_))
    }
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id`. Returns `false` if it was already outstanding.
    pub fn insert(&self, id: CorrelationId, subject: &str, kind: &Specialization) -> bool {
        let entry = PendingEntry {
            subject: subject.to_string(),
            kind: kind.clone(),
            issued_at: Instant::now(),
        };
        let mut map = self.inner.lock();
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, entry);
        true
    }

    pub fn retire(&self, id: &CorrelationId) -> ReplyOutcome {
        match self.inner.lock().remove(id) {
            Some(entry) => ReplyOutcome::Retired(entry),
            None => ReplyOutcome::Unknown,
        }
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drops every entry older than `ttl` and returns what was dropped.
    pub fn sweep_expired(&self, ttl: Duration) -> Vec<(CorrelationId, PendingEntry)> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let expired: Vec<CorrelationId> = map
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.issued_at) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| map.remove(&id).map(|e| (id, e)))
            .collect()
    }
}
