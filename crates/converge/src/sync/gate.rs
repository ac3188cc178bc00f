//! Per-application admission for sync operations.
//!
//! At most one sync runs per application. A request for the revision already
//! in flight is coalesced into it; a request for another revision is parked
//! as the single follow-up the running sync picks up when it finishes.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use super::operation::{SyncOperation, SyncTrigger};
use crate::source::Revision;

/// What a sync request turned into. Contention is never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncRequestOutcome {
    Completed(SyncOperation),
    /// A sync for the same revision was already running.
    Coalesced { revision: String },
    /// Another revision was in flight; this one runs right after it.
    Queued { revision: String },
}

#[derive(Default)]
struct GateState {
    in_flight: Option<Revision>,
    follow_up: Option<(Revision, SyncTrigger)>,
}

#[derive(Default)]
pub struct SyncGate {
    state: Mutex<GateState>,
}

pub enum Admission {
    Entered(SyncPermit),
    Coalesced,
    Queued,
}

impl SyncGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_enter(self: &Arc<Self>, revision: &Revision, trigger: SyncTrigger) -> Admission {
        let mut state = self.lock();
        let current = state.in_flight.as_ref().map(|r| r.id.clone());
        match current {
            None => {
                state.in_flight = Some(revision.clone());
                Admission::Entered(SyncPermit { gate: self.clone() })
            }
            Some(id) if id == revision.id => Admission::Coalesced,
            Some(_) => {
                // A newer request replaces an older parked one.
                state.follow_up = Some((revision.clone(), trigger));
                Admission::Queued
            }
        }
    }

    /// Enters only when idle. Never parks a follow-up.
    pub fn try_acquire(self: &Arc<Self>, revision: &Revision) -> Option<SyncPermit> {
        let mut state = self.lock();
        if state.in_flight.is_some() {
            return None;
        }
        state.in_flight = Some(revision.clone());
        Some(SyncPermit { gate: self.clone() })
    }

    /// Revision currently being synced, if any.
    pub fn in_flight(&self) -> Option<Revision> {
        self.lock().in_flight.clone()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held while a sync runs. Dropping it opens the gate.
pub struct SyncPermit {
    gate: Arc<SyncGate>,
}

impl SyncPermit {
    /// Takes the parked follow-up, keeping the gate closed for it.
    pub fn next_follow_up(&mut self) -> Option<(Revision, SyncTrigger)> {
        let mut state = self.gate.lock();
        let (revision, trigger) = state.follow_up.take()?;
        state.in_flight = Some(revision.clone());
        Some((revision, trigger))
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.in_flight = None;
        if let Some((revision, _)) = state.follow_up.take() {
            log::warn!("Discarding queued sync to {}", revision.short_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: &str) -> Revision {
        Revision::new(id, "deploy")
    }

    #[test]
    fn test_coalesce_same_revision() {
        let gate = SyncGate::new();
        let permit = match gate.try_enter(&rev("a"), SyncTrigger::NewRevision) {
            Admission::Entered(p) => p,
            _ => panic!("gate should be open"),
        };
        assert!(matches!(gate.try_enter(&rev("a"), SyncTrigger::Manual), Admission::Coalesced));
        assert_eq!(gate.in_flight().map(|r| r.id), Some("a".to_string()));

        drop(permit);
        assert!(gate.in_flight().is_none());
        assert!(matches!(gate.try_enter(&rev("a"), SyncTrigger::Manual), Admission::Entered(_)));
    }

    #[test]
    fn test_follow_up_runs_latest_revision() {
        let gate = SyncGate::new();
        let Admission::Entered(mut permit) = gate.try_enter(&rev("a"), SyncTrigger::NewRevision) else {
            panic!("gate should be open");
        };
        assert!(matches!(gate.try_enter(&rev("b"), SyncTrigger::NewRevision), Admission::Queued));
        assert!(matches!(gate.try_enter(&rev("c"), SyncTrigger::Manual), Admission::Queued));

        let (next, trigger) = permit.next_follow_up().unwrap();
        assert_eq!(next.id, "c");
        assert_eq!(trigger, SyncTrigger::Manual);
        assert!(matches!(gate.try_enter(&rev("c"), SyncTrigger::Manual), Admission::Coalesced));
        assert!(permit.next_follow_up().is_none());
    }

    #[test]
    fn test_dropped_permit_discards_follow_up() {
        let gate = SyncGate::new();
        let Admission::Entered(permit) = gate.try_enter(&rev("a"), SyncTrigger::Manual) else {
            panic!("gate should be open");
        };
        assert!(matches!(gate.try_enter(&rev("b"), SyncTrigger::Manual), Admission::Queued));
        drop(permit);

        assert!(gate.in_flight().is_none());
        let Admission::Entered(mut permit) = gate.try_enter(&rev("c"), SyncTrigger::Manual) else {
            panic!("gate should be open");
        };
        assert!(permit.next_follow_up().is_none());
    }

    #[test]
    fn test_try_acquire_does_not_queue() {
        let gate = SyncGate::new();
        let permit = gate.try_acquire(&rev("a")).unwrap();
        assert!(gate.try_acquire(&rev("b")).is_none());
        drop(permit);
        let Admission::Entered(mut permit) = gate.try_enter(&rev("c"), SyncTrigger::Manual) else {
            panic!("gate should be open");
        };
        assert!(permit.next_follow_up().is_none());
    }
}
