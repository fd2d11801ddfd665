use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, error, info_span};
use uuid::Uuid;

use super::backoff::backoff_delay;
use crate::crdt::MergeConflict;
use crate::error::SyncError;
use crate::state::LabState;
use crate::types::{ChangeEvent, EntityPayload, EntityRef, LocalEdit, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPhase {
    /// Waiting for the first backlog or snapshot.
    Connecting,
    Live,
    /// A resume request is outstanding. Live events are held until the reply.
    Reconciling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub edit_id: Uuid,
    pub edit: LocalEdit,
    pub attempts: u32,
    pub acked: bool,
    pub staged_at: DateTime<Utc>,
}

impl PendingEdit {
    /// How long to wait before the next resend.
    pub fn retry_delay(&self) -> Duration {
        backoff_delay(self.attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Applied,
    Duplicate,
    /// Held until the outstanding reconciliation completes.
    Held,
    /// A sequence gap was detected. The event is held and the caller must
    /// send [`LabReplica::resume_request`].
    Gap { expected: i64, received: i64 },
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub lab_id: Uuid,
    pub last_seq: Option<i64>,
}

/// Server answer to a resume request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileReply {
    Backlog { events: Vec<ChangeEvent>, head_seq: i64 },
    Snapshot { state: LabState, seq: i64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Optimistic edits superseded by authoritative state.
    pub discarded: Vec<PendingEdit>,
    /// Edits the caller must send again.
    pub resend: Vec<PendingEdit>,
    pub conflicts: Vec<MergeConflict>,
    /// Held events still leave a gap; another resume is required.
    pub needs_resume: bool,
}

/// One client's view of one lab.
#[derive(Debug, Clone)]
pub struct LabReplica {
    lab_id: Uuid,
    user_id: Uuid,
    last_seq: Option<i64>,
    state: LabState,
    pending: Vec<PendingEdit>,
    held: BTreeMap<i64, ChangeEvent>,
    phase: ReplicaPhase,
    author_seq: u64,
}

impl LabReplica {
    pub fn new(lab_id: Uuid, user_id: Uuid) -> Self {
        Self {
            lab_id,
            user_id,
            last_seq: None,
            state: LabState::new(lab_id),
            pending: Vec::new(),
            held: BTreeMap::new(),
            phase: ReplicaPhase::Connecting,
            author_seq: 0,
        }
    }

    pub fn lab_id(&self) -> Uuid {
        self.lab_id
    }

    pub fn last_seq(&self) -> Option<i64> {
        self.last_seq
    }

    pub fn phase(&self) -> ReplicaPhase {
        self.phase
    }

    /// Authoritative state, without optimistic edits.
    pub fn committed(&self) -> &LabState {
        &self.state
    }

    pub fn pending(&self) -> &[PendingEdit] {
        &self.pending
    }

    /// Committed state with every pending edit applied on top.
    pub fn view(&self, now: DateTime<Utc>) -> LabState {
        let mut view = self.state.clone();
        for pending in &self.pending {
            if let Err(conflict) = view.apply_local_edit(self.user_id, &pending.edit, now) {
                error!(
                    lab_id = %self.lab_id,
                    edit_id = %pending.edit_id,
                    error = %conflict,
                    "optimistic edit conflicts with committed state"
                );
            }
        }
        view
    }

    pub fn next_clock(&self) -> u64 {
        let pending_max = self.pending.iter().filter_map(|p| p.edit.clock()).max();
        self.state.next_clock().max(pending_max.map_or(0, |clock| clock.saturating_add(1)))
    }

    pub fn next_author_seq(&mut self) -> u64 {
        let seq = self.author_seq;
        self.author_seq += 1;
        seq
    }

    /// Record an optimistic edit. Returns its id for the `local_edit` frame.
    pub fn stage(&mut self, edit: LocalEdit, now: DateTime<Utc>) -> Uuid {
        let edit_id = Uuid::new_v4();
        self.pending.push(PendingEdit { edit_id, edit, attempts: 1, acked: false, staged_at: now });
        edit_id
    }

    pub fn acknowledge(&mut self, edit_id: Uuid) -> bool {
        match self.pending.iter_mut().find(|pending| pending.edit_id == edit_id) {
            Some(pending) => {
                pending.acked = true;
                true
            }
            None => false,
        }
    }

    /// Drop a rejected edit. Returns it so the caller can surface the reason.
    pub fn reject(&mut self, edit_id: Uuid) -> Option<PendingEdit> {
        let index = self.pending.iter().position(|pending| pending.edit_id == edit_id)?;
        Some(self.pending.remove(index))
    }

    /// Record a retryable failure for an edit and return the delay before it
    /// should be sent again.
    pub fn record_failure(&mut self, edit_id: Uuid) -> Option<Duration> {
        let pending = self.pending.iter_mut().find(|pending| pending.edit_id == edit_id)?;
        let delay = backoff_delay(pending.attempts.saturating_sub(1));
        pending.attempts = pending.attempts.saturating_add(1);
        Some(delay)
    }

    fn expected_seq(&self) -> i64 {
        self.last_seq.map_or(1, |seq| seq + 1)
    }

    /// Feed one live event from the subscription.
    pub fn receive(&mut self, event: ChangeEvent) -> Result<ReceiveOutcome, SyncError> {
        if event.lab_id != self.lab_id {
            return Ok(ReceiveOutcome::Ignored);
        }
        let expected = self.expected_seq();
        if event.seq < expected {
            return Ok(ReceiveOutcome::Duplicate);
        }

        match self.phase {
            ReplicaPhase::Connecting | ReplicaPhase::Reconciling => {
                self.held.insert(event.seq, event);
                Ok(ReceiveOutcome::Held)
            }
            ReplicaPhase::Live if event.seq > expected => {
                let received = event.seq;
                debug!(lab_id = %self.lab_id, expected, received, "sequence gap");
                self.held.insert(received, event);
                self.phase = ReplicaPhase::Reconciling;
                Ok(ReceiveOutcome::Gap { expected, received })
            }
            ReplicaPhase::Live => match self.commit(&event) {
                Ok(()) => Ok(ReceiveOutcome::Applied),
                Err(conflict) => Err(SyncError::Conflict(conflict)),
            },
        }
    }

    /// Start (or restart) reconciliation.
    pub fn resume_request(&mut self) -> ResumeRequest {
        self.phase = ReplicaPhase::Reconciling;
        ResumeRequest { lab_id: self.lab_id, last_seq: self.last_seq }
    }

    /// Apply the server's answer to a resume request.
    pub fn apply_reconcile(&mut self, reply: ReconcileReply) -> Result<ReconcileOutcome, SyncError> {
        let span = info_span!("replica.reconcile", lab_id = %self.lab_id, last_seq = ?self.last_seq);
        let _entered = span.enter();

        let lab_id = self.lab_id;
        let mut outcome = ReconcileOutcome::default();
        let touched = match reply {
            ReconcileReply::Backlog { events, head_seq } => {
                let mut touched = BTreeSet::new();
                for event in events.iter().filter(|event| event.lab_id == lab_id) {
                    let expected = self.expected_seq();
                    if event.seq < expected {
                        continue;
                    }
                    if event.seq > expected {
                        return Err(SyncError::BacklogUnavailable {
                            lab_id,
                            requested_after: expected - 1,
                            oldest_retained: event.seq,
                        });
                    }
                    touched.insert(event.entity_ref());
                    if let Err(conflict) = self.commit(event) {
                        outcome.conflicts.push(conflict);
                    }
                }
                if head_seq >= self.expected_seq() {
                    return Err(SyncError::BacklogUnavailable {
                        lab_id,
                        requested_after: self.expected_seq() - 1,
                        oldest_retained: head_seq,
                    });
                }
                touched
            }
            ReconcileReply::Snapshot { state, seq } => {
                if self.last_seq.is_some_and(|last| seq < last) {
                    debug!(seq, "ignoring stale snapshot");
                    BTreeSet::new()
                } else {
                    let touched = self.state.changed_entities(&state);
                    self.state = state;
                    self.last_seq = Some(seq);
                    touched
                }
            }
        };

        let (discarded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| touched.contains(&pending.edit.target(lab_id)));
        self.pending = kept;
        outcome.discarded = discarded;

        for pending in self.pending.iter_mut().filter(|pending| !pending.acked) {
            pending.attempts = pending.attempts.saturating_add(1);
            outcome.resend.push(pending.clone());
        }

        let held = std::mem::take(&mut self.held);
        for (seq, event) in held {
            let expected = self.expected_seq();
            if seq < expected {
                continue;
            }
            if seq > expected {
                self.held.insert(seq, event);
                continue;
            }
            if let Err(conflict) = self.commit(&event) {
                outcome.conflicts.push(conflict);
            }
        }

        outcome.needs_resume = !self.held.is_empty();
        self.phase =
            if outcome.needs_resume { ReplicaPhase::Reconciling } else { ReplicaPhase::Live };
        Ok(outcome)
    }

    fn commit(&mut self, event: &ChangeEvent) -> Result<(), MergeConflict> {
        let applied = self.state.apply_event(event);
        self.last_seq = Some(event.seq);
        let user_id = self.user_id;
        self.pending.retain(|pending| !confirmed_by(&pending.edit, event, user_id));
        if let Err(conflict) = &applied {
            error!(
                lab_id = %event.lab_id,
                seq = event.seq,
                entity = %event.entity_id,
                error = %conflict,
                "merge conflict applying event"
            );
        }
        applied
    }
}

/// Whether `event` is the committed result of `edit` made by `author`.
fn confirmed_by(edit: &LocalEdit, event: &ChangeEvent, author: Uuid) -> bool {
    let target: EntityRef = edit.target(event.lab_id);
    if target != event.entity_ref() {
        return false;
    }
    match (edit, &event.payload) {
        (LocalEdit::CreateWhiteboard { .. }, EntityPayload::Whiteboard(_)) => true,
        (
            LocalEdit::DrawStroke { .. } | LocalEdit::EraseStroke { .. },
            EntityPayload::Stroke(stroke),
        ) => stroke.author_id == author,
        (LocalEdit::PostMessage { .. }, EntityPayload::ChatMessage(message)) => {
            message.author_id == author
        }
        (LocalEdit::CreateTodo { clock, .. }, EntityPayload::Todo(todo))
        | (LocalEdit::SetTodoDone { clock, .. }, EntityPayload::Todo(todo))
        | (LocalEdit::DeleteTodo { clock, .. }, EntityPayload::Todo(todo)) => {
            todo.clock == *clock && todo.modified_by == author
        }
        (LocalEdit::SetMemberRole { clock, .. }, EntityPayload::Membership(membership))
        | (LocalEdit::RemoveMember { clock, .. }, EntityPayload::Membership(membership)) => {
            membership.clock == *clock && membership.changed_by == author
        }
        (LocalEdit::RenameLab { name }, EntityPayload::Lab(lab)) => {
            event.op != Operation::Delete && lab.name == *name
        }
        (LocalEdit::DeleteLab, EntityPayload::Lab(_)) => event.op == Operation::Delete,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, Todo};
    use chrono::TimeZone;

    const LAB: Uuid = Uuid::from_u128(100);
    const ME: Uuid = Uuid::from_u128(1);
    const PEER: Uuid = Uuid::from_u128(2);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn todo_event(seq: i64, todo_id: u128, done: bool, clock: u64, author: Uuid) -> ChangeEvent {
        let op = if seq == 1 || clock == 1 { Operation::Insert } else { Operation::Update };
        ChangeEvent {
            lab_id: LAB,
            seq,
            entity_id: Uuid::from_u128(todo_id),
            op,
            payload: EntityPayload::Todo(Todo {
                id: Uuid::from_u128(todo_id),
                lab_id: LAB,
                text: format!("todo {todo_id}"),
                done,
                clock,
                modified_by: author,
            }),
            committed_at: at(seq),
        }
    }

    /// Twelve events over three todos, seq 1..=12.
    fn history() -> Vec<ChangeEvent> {
        (1..=12)
            .map(|seq| {
                let todo_id = 10 + (seq as u128 % 3);
                todo_event(seq, todo_id, seq % 2 == 0, seq as u64, PEER)
            })
            .collect()
    }

    fn live(replica: &mut LabReplica) {
        replica.resume_request();
        replica
            .apply_reconcile(ReconcileReply::Backlog { events: Vec::new(), head_seq: 0 })
            .unwrap();
        assert_eq!(replica.phase(), ReplicaPhase::Live);
    }

    #[test]
    fn live_events_apply_in_order_and_duplicates_are_ignored() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        let events = history();

        assert_eq!(replica.receive(events[0].clone()).unwrap(), ReceiveOutcome::Applied);
        assert_eq!(replica.receive(events[1].clone()).unwrap(), ReceiveOutcome::Applied);
        assert_eq!(replica.receive(events[0].clone()).unwrap(), ReceiveOutcome::Duplicate);
        assert_eq!(replica.last_seq(), Some(2));
    }

    #[test]
    fn events_before_first_reconcile_are_held() {
        let mut replica = LabReplica::new(LAB, ME);
        let events = history();
        assert_eq!(replica.receive(events[1].clone()).unwrap(), ReceiveOutcome::Held);

        replica.resume_request();
        let outcome = replica
            .apply_reconcile(ReconcileReply::Backlog { events: vec![events[0].clone()], head_seq: 1 })
            .unwrap();

        assert!(!outcome.needs_resume);
        assert_eq!(replica.last_seq(), Some(2));
        assert_eq!(replica.phase(), ReplicaPhase::Live);
    }

    #[test]
    fn gap_holds_event_and_requests_resume_from_last_seq() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        let events = history();
        replica.receive(events[0].clone()).unwrap();

        let outcome = replica.receive(events[3].clone()).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Gap { expected: 2, received: 4 });
        assert_eq!(replica.phase(), ReplicaPhase::Reconciling);
        assert_eq!(replica.receive(events[4].clone()).unwrap(), ReceiveOutcome::Held);

        let request = replica.resume_request();
        assert_eq!(request.last_seq, Some(1));

        let backlog = events[1..3].to_vec();
        let outcome =
            replica.apply_reconcile(ReconcileReply::Backlog { events: backlog, head_seq: 3 }).unwrap();
        assert!(!outcome.needs_resume);
        assert_eq!(replica.last_seq(), Some(5));
        assert_eq!(replica.phase(), ReplicaPhase::Live);
    }

    #[test]
    fn reconnect_after_seq_ten_converges_with_uninterrupted_replica() {
        let events = history();

        let mut steady = LabReplica::new(LAB, ME);
        live(&mut steady);
        for event in &events {
            steady.receive(event.clone()).unwrap();
        }

        let mut flaky = LabReplica::new(LAB, ME);
        live(&mut flaky);
        for event in &events[..10] {
            flaky.receive(event.clone()).unwrap();
        }
        let request = flaky.resume_request();
        assert_eq!(request.last_seq, Some(10));

        // The relay retains 4..=12; it replays only what follows the request.
        let replay: Vec<ChangeEvent> =
            events[3..].iter().filter(|e| e.seq > 10).cloned().collect();
        flaky.apply_reconcile(ReconcileReply::Backlog { events: replay, head_seq: 12 }).unwrap();

        assert_eq!(flaky.last_seq(), Some(12));
        assert_eq!(flaky.committed(), steady.committed());
    }

    #[test]
    fn backlog_with_a_hole_is_rejected_without_skipping() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        let events = history();
        replica.receive(events[0].clone()).unwrap();
        replica.resume_request();

        let error = replica
            .apply_reconcile(ReconcileReply::Backlog { events: vec![events[2].clone()], head_seq: 3 })
            .unwrap_err();
        assert!(matches!(error, SyncError::BacklogUnavailable { requested_after: 1, .. }));
        assert_eq!(replica.last_seq(), Some(1));
    }

    #[test]
    fn reconcile_discards_edits_on_touched_entities_and_resends_the_rest() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        replica.receive(todo_event(1, 10, false, 1, PEER)).unwrap();
        replica.receive(todo_event(2, 11, false, 1, PEER)).unwrap();

        let touched = replica.stage(
            LocalEdit::SetTodoDone { todo_id: Uuid::from_u128(10), done: true, clock: 2 },
            at(3),
        );
        let untouched = replica.stage(
            LocalEdit::SetTodoDone { todo_id: Uuid::from_u128(11), done: true, clock: 3 },
            at(3),
        );

        replica.resume_request();
        let outcome = replica
            .apply_reconcile(ReconcileReply::Backlog {
                events: vec![todo_event(3, 10, false, 5, PEER)],
                head_seq: 3,
            })
            .unwrap();

        assert_eq!(outcome.discarded.iter().map(|p| p.edit_id).collect::<Vec<_>>(), vec![touched]);
        assert_eq!(outcome.resend.iter().map(|p| p.edit_id).collect::<Vec<_>>(), vec![untouched]);
        assert_eq!(outcome.resend[0].attempts, 2);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn snapshot_reply_replaces_state_and_discards_changed_targets() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        replica.receive(todo_event(1, 10, false, 1, PEER)).unwrap();
        replica.stage(
            LocalEdit::SetTodoDone { todo_id: Uuid::from_u128(10), done: true, clock: 2 },
            at(2),
        );

        let mut server = replica.committed().clone();
        server.apply_event(&todo_event(40, 10, true, 9, PEER)).unwrap();

        replica.resume_request();
        let outcome =
            replica.apply_reconcile(ReconcileReply::Snapshot { state: server.clone(), seq: 40 }).unwrap();

        assert_eq!(outcome.discarded.len(), 1);
        assert!(replica.pending().is_empty());
        assert_eq!(replica.last_seq(), Some(40));
        assert_eq!(replica.committed(), &server);
    }

    #[test]
    fn own_committed_event_confirms_pending_edit() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        replica.receive(todo_event(1, 10, false, 1, PEER)).unwrap();
        let edit_id = replica.stage(
            LocalEdit::SetTodoDone { todo_id: Uuid::from_u128(10), done: true, clock: 2 },
            at(2),
        );
        assert!(replica.acknowledge(edit_id));

        replica.receive(todo_event(2, 10, true, 2, ME)).unwrap();
        assert!(replica.pending().is_empty());
    }

    #[test]
    fn view_layers_pending_edits_over_committed_state() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        replica.receive(todo_event(1, 10, false, 1, PEER)).unwrap();
        let clock = replica.next_clock();
        replica.stage(
            LocalEdit::SetTodoDone { todo_id: Uuid::from_u128(10), done: true, clock },
            at(2),
        );

        let view = replica.view(at(2));
        assert_eq!(view.todo(&Uuid::from_u128(10)).map(|t| t.done), Some(true));
        assert_eq!(replica.committed().todo(&Uuid::from_u128(10)).map(|t| t.done), Some(false));
        assert_eq!(replica.next_clock(), clock + 1);
    }

    #[test]
    fn next_clock_saturates_with_a_maximal_pending_clock() {
        let mut replica = LabReplica::new(LAB, ME);
        live(&mut replica);
        replica.stage(
            LocalEdit::SetTodoDone { todo_id: Uuid::from_u128(10), done: true, clock: u64::MAX },
            at(1),
        );
        assert_eq!(replica.next_clock(), u64::MAX);
    }

    #[test]
    fn rejected_edit_is_dropped_and_failures_back_off() {
        let mut replica = LabReplica::new(LAB, ME);
        let first = replica.stage(
            LocalEdit::SetMemberRole { user_id: PEER, role: Role::Admin, clock: 1 },
            at(0),
        );
        let second = replica.stage(LocalEdit::DeleteLab, at(0));

        assert_eq!(replica.record_failure(second), Some(Duration::from_millis(250)));
        assert_eq!(replica.record_failure(second), Some(Duration::from_millis(500)));
        assert!(replica.reject(first).is_some());
        assert_eq!(replica.pending().len(), 1);
    }
}
