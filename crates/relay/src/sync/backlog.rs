use std::collections::VecDeque;

use labsync_common::crdt::MergeConflict;
use labsync_common::error::SyncError;
use labsync_common::state::LabState;
use labsync_common::sync::ReconcileReply;
use labsync_common::types::ChangeEvent;
use uuid::Uuid;

/// Retained history of one lab: the newest `capacity` events plus the state
/// they materialize. Events cover the range `(base_seq, head_seq]`.
#[derive(Debug, Clone)]
pub struct LabBacklog {
    capacity: usize,
    events: VecDeque<ChangeEvent>,
    state: LabState,
    head_seq: i64,
    base_seq: i64,
}

impl LabBacklog {
    pub fn new(lab_id: Uuid, capacity: usize) -> Self {
        Self::hydrated(LabState::new(lab_id), 0, capacity)
    }

    /// Backlog for a lab whose state was loaded from the store at `head_seq`.
    /// Nothing before that point can be replayed from memory.
    pub fn hydrated(state: LabState, head_seq: i64, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            state,
            head_seq,
            base_seq: head_seq,
        }
    }

    pub fn lab_id(&self) -> Uuid {
        self.state.lab_id
    }

    pub fn state(&self) -> &LabState {
        &self.state
    }

    pub fn head_seq(&self) -> i64 {
        self.head_seq
    }

    pub fn base_seq(&self) -> i64 {
        self.base_seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Retain `event` and fold it into the state. The event is retained even
    /// when folding reports a conflict.
    pub fn append(&mut self, event: &ChangeEvent) -> Result<(), MergeConflict> {
        let applied = self.state.apply_event(event);
        self.head_seq = self.head_seq.max(event.seq);
        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_front() {
                self.base_seq = evicted.seq;
            }
        }
        applied
    }

    /// Retained events after `after_seq`.
    pub fn events_after(&self, after_seq: i64) -> Result<Vec<ChangeEvent>, SyncError> {
        if after_seq < self.base_seq {
            return Err(SyncError::BacklogUnavailable {
                lab_id: self.lab_id(),
                requested_after: after_seq,
                oldest_retained: self.base_seq + 1,
            });
        }
        Ok(self.events.iter().filter(|event| event.seq > after_seq).cloned().collect())
    }

    /// Answer to a client that last applied `last_seq`.
    ///
    /// Clients without a position, or ahead of this backlog, get a snapshot.
    /// A compacted range is reported as `BacklogUnavailable` so the caller
    /// can try older storage before falling back to [`Self::snapshot`].
    pub fn reconcile_reply(&self, last_seq: Option<i64>) -> Result<ReconcileReply, SyncError> {
        match last_seq {
            None => Ok(self.snapshot()),
            Some(after) if after > self.head_seq => Ok(self.snapshot()),
            Some(after) => Ok(ReconcileReply::Backlog {
                events: self.events_after(after)?,
                head_seq: self.head_seq,
            }),
        }
    }

    pub fn snapshot(&self) -> ReconcileReply {
        ReconcileReply::Snapshot { state: self.state.clone(), seq: self.head_seq }
    }
}
