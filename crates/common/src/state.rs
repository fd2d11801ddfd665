// Materialized lab state.
//
// `LabState` is what a replica (or the relay's backlog) believes a lab looks
// like after applying a stream of change events. Committed events carry their
// lab sequence number; optimistic local edits are applied with a pending
// position and are replaced once their committed copy arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use crate::crdt::{max_stamp, EntryOrder, LwwRegister, MergeConflict, OrderedLog, Sequence, Stamp};
use crate::types::{
    ChangeEvent, ChatMessage, EntityKind, EntityPayload, EntityRef, Lab, LocalEdit, Membership,
    Operation, Role, Stroke, Todo, UserProfile, Whiteboard,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
    pub lab_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub role: LwwRegister<Role>,
    /// Stamp of the latest removal. The membership is active only while the
    /// role stamp is newer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Stamp>,
}

impl MembershipState {
    fn from_row(row: &Membership) -> Self {
        Self {
            lab_id: row.lab_id,
            user_id: row.user_id,
            joined_at: row.joined_at,
            role: LwwRegister::new(row.role, row_stamp(row)),
            removed: None,
        }
    }

    fn merge_row(&mut self, row: &Membership) -> Result<(), MergeConflict> {
        let stamp = row_stamp(row);
        if stamp > self.role.stamp {
            self.joined_at = row.joined_at;
        } else if stamp == self.role.stamp {
            self.joined_at = self.joined_at.min(row.joined_at);
        }
        self.role.set(row.role, stamp, "membership.role")?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.removed.map_or(true, |removed| self.role.stamp > removed)
    }

    pub fn to_membership(&self) -> Membership {
        Membership {
            lab_id: self.lab_id,
            user_id: self.user_id,
            role: *self.role.get(),
            clock: self.role.stamp.clock,
            changed_by: self.role.stamp.author,
            joined_at: self.joined_at,
        }
    }
}

fn row_stamp(row: &Membership) -> Stamp {
    Stamp::new(row.clock, row.changed_by)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoState {
    pub id: Uuid,
    pub lab_id: Uuid,
    pub text: LwwRegister<String>,
    pub done: LwwRegister<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Stamp>,
}

impl TodoState {
    fn from_row(row: &Todo) -> Self {
        let stamp = todo_stamp(row);
        Self {
            id: row.id,
            lab_id: row.lab_id,
            text: LwwRegister::new(row.text.clone(), stamp),
            done: LwwRegister::new(row.done, stamp),
            deleted: None,
        }
    }

    fn merge_row(&mut self, row: &Todo) -> Result<(), MergeConflict> {
        let stamp = todo_stamp(row);
        self.text.set(row.text.clone(), stamp, "todo.text")?;
        self.done.set(row.done, stamp, "todo.done")?;
        Ok(())
    }

    fn last_write(&self) -> Stamp {
        self.text.stamp.max(self.done.stamp)
    }

    pub fn is_visible(&self) -> bool {
        self.deleted.map_or(true, |deleted| self.last_write() > deleted)
    }

    pub fn to_todo(&self) -> Todo {
        let stamp = self.last_write();
        Todo {
            id: self.id,
            lab_id: self.lab_id,
            text: self.text.get().clone(),
            done: *self.done.get(),
            clock: stamp.clock,
            modified_by: stamp.author,
        }
    }
}

fn todo_stamp(row: &Todo) -> Stamp {
    Stamp::new(row.clock, row.modified_by)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabState {
    pub lab_id: Uuid,
    #[serde(default)]
    pub lab: Option<Lab>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub members: BTreeMap<Uuid, MembershipState>,
    #[serde(default)]
    pub profiles: BTreeMap<Uuid, UserProfile>,
    #[serde(default)]
    pub whiteboards: BTreeMap<Uuid, Whiteboard>,
    /// Stroke log per whiteboard.
    #[serde(default)]
    pub strokes: BTreeMap<Uuid, OrderedLog<Stroke>>,
    #[serde(default)]
    pub messages: OrderedLog<ChatMessage>,
    #[serde(default)]
    pub todos: BTreeMap<Uuid, TodoState>,
    #[serde(default)]
    pub max_clock: u64,
}

impl LabState {
    pub fn new(lab_id: Uuid) -> Self {
        Self { lab_id, ..Self::default() }
    }

    /// Apply a committed, sequenced event.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<(), MergeConflict> {
        self.apply_mutation(event.op, &event.payload, Sequence::Committed(event.seq))
    }

    /// Apply a local edit optimistically, before the relay has sequenced it.
    pub fn apply_local_edit(
        &mut self,
        author: Uuid,
        edit: &LocalEdit,
        now: DateTime<Utc>,
    ) -> Result<(), MergeConflict> {
        for (op, payload) in self.plan_edit(author, edit, now) {
            self.apply_mutation(op, &payload, Sequence::Pending)?;
        }
        Ok(())
    }

    /// The row mutations an edit produces against the current state. Edits
    /// that reference a missing entity produce nothing.
    pub fn plan_edit(
        &self,
        author: Uuid,
        edit: &LocalEdit,
        now: DateTime<Utc>,
    ) -> Vec<(Operation, EntityPayload)> {
        let lab_id = self.lab_id;
        match edit {
            LocalEdit::CreateWhiteboard { whiteboard_id, name } => vec![(
                Operation::Insert,
                EntityPayload::Whiteboard(Whiteboard {
                    id: *whiteboard_id,
                    lab_id,
                    name: name.clone(),
                }),
            )],
            LocalEdit::DrawStroke { stroke_id, whiteboard_id, geometry, clock, author_seq } => {
                vec![(
                    Operation::Insert,
                    EntityPayload::Stroke(Stroke {
                        id: *stroke_id,
                        whiteboard_id: *whiteboard_id,
                        lab_id,
                        author_id: author,
                        geometry: geometry.clone(),
                        clock: *clock,
                        author_seq: *author_seq,
                        erases: None,
                    }),
                )]
            }
            LocalEdit::EraseStroke {
                stroke_id,
                whiteboard_id,
                target_stroke_id,
                clock,
                author_seq,
            } => vec![(
                Operation::Insert,
                EntityPayload::Stroke(Stroke {
                    id: *stroke_id,
                    whiteboard_id: *whiteboard_id,
                    lab_id,
                    author_id: author,
                    geometry: serde_json::Value::Null,
                    clock: *clock,
                    author_seq: *author_seq,
                    erases: Some(*target_stroke_id),
                }),
            )],
            LocalEdit::PostMessage { message_id, text, clock, author_seq } => vec![(
                Operation::Insert,
                EntityPayload::ChatMessage(ChatMessage {
                    id: *message_id,
                    lab_id,
                    author_id: author,
                    text: text.clone(),
                    created_at: now,
                    clock: *clock,
                    author_seq: *author_seq,
                    seq: 0,
                }),
            )],
            LocalEdit::CreateTodo { todo_id, text, clock } => vec![(
                Operation::Insert,
                EntityPayload::Todo(Todo {
                    id: *todo_id,
                    lab_id,
                    text: text.clone(),
                    done: false,
                    clock: *clock,
                    modified_by: author,
                }),
            )],
            LocalEdit::SetTodoDone { todo_id, done, clock } => self
                .todo(todo_id)
                .map(|todo| {
                    (
                        Operation::Update,
                        EntityPayload::Todo(Todo {
                            done: *done,
                            clock: *clock,
                            modified_by: author,
                            ..todo
                        }),
                    )
                })
                .into_iter()
                .collect(),
            LocalEdit::DeleteTodo { todo_id, clock } => self
                .todo(todo_id)
                .map(|todo| {
                    (
                        Operation::Delete,
                        EntityPayload::Todo(Todo { clock: *clock, modified_by: author, ..todo }),
                    )
                })
                .into_iter()
                .collect(),
            LocalEdit::SetMemberRole { user_id, role, clock } => self
                .membership(user_id)
                .map(|membership| {
                    (
                        Operation::Update,
                        EntityPayload::Membership(Membership {
                            role: *role,
                            clock: *clock,
                            changed_by: author,
                            ..membership
                        }),
                    )
                })
                .into_iter()
                .collect(),
            LocalEdit::RemoveMember { user_id, clock } => self
                .membership(user_id)
                .map(|membership| {
                    (
                        Operation::Delete,
                        EntityPayload::Membership(Membership {
                            clock: *clock,
                            changed_by: author,
                            ..membership
                        }),
                    )
                })
                .into_iter()
                .collect(),
            LocalEdit::RenameLab { name } => self
                .lab
                .as_ref()
                .map(|lab| {
                    (Operation::Update, EntityPayload::Lab(Lab { name: name.clone(), ..lab.clone() }))
                })
                .into_iter()
                .collect(),
            LocalEdit::DeleteLab => self
                .lab
                .as_ref()
                .map(|lab| (Operation::Delete, EntityPayload::Lab(lab.clone())))
                .into_iter()
                .collect(),
        }
    }

    fn apply_mutation(
        &mut self,
        op: Operation,
        payload: &EntityPayload,
        seq: Sequence,
    ) -> Result<(), MergeConflict> {
        if self.deleted && !matches!(payload, EntityPayload::Lab(_)) {
            debug!(lab_id = %self.lab_id, kind = payload.kind().as_str(), "ignoring mutation for deleted lab");
            return Ok(());
        }

        match payload {
            EntityPayload::Lab(lab) => match op {
                Operation::Insert | Operation::Update => {
                    if !self.deleted {
                        self.lab = Some(lab.clone());
                    }
                }
                Operation::Delete => self.mark_deleted(lab.clone()),
            },
            EntityPayload::Membership(row) => {
                self.observe_clock(row.clock);
                let stamp = row_stamp(row);
                let entry = self
                    .members
                    .entry(row.user_id)
                    .or_insert_with(|| MembershipState::from_row(row));
                entry.merge_row(row)?;
                if op == Operation::Delete {
                    entry.removed = max_stamp(entry.removed, Some(stamp));
                }
            }
            EntityPayload::Whiteboard(whiteboard) => match op {
                Operation::Insert | Operation::Update => {
                    self.whiteboards.insert(whiteboard.id, whiteboard.clone());
                }
                Operation::Delete => {
                    self.whiteboards.remove(&whiteboard.id);
                    self.strokes.remove(&whiteboard.id);
                }
            },
            EntityPayload::Stroke(stroke) => {
                self.observe_clock(stroke.clock);
                let log = self.strokes.entry(stroke.whiteboard_id).or_default();
                match op {
                    Operation::Insert | Operation::Update => {
                        let order = EntryOrder {
                            seq,
                            clock: stroke.clock,
                            author: stroke.author_id,
                            author_seq: stroke.author_seq,
                        };
                        log.insert(stroke.id, order, stroke.clone())?;
                    }
                    Operation::Delete => {
                        log.remove(&stroke.id);
                    }
                }
            }
            EntityPayload::ChatMessage(message) => {
                self.observe_clock(message.clock);
                match op {
                    Operation::Insert | Operation::Update => {
                        let mut message = message.clone();
                        if let Sequence::Committed(committed) = seq {
                            message.seq = committed;
                        }
                        let order = EntryOrder {
                            seq,
                            clock: message.clock,
                            author: message.author_id,
                            author_seq: message.author_seq,
                        };
                        self.messages.insert(message.id, order, message)?;
                    }
                    Operation::Delete => {
                        self.messages.remove(&message.id);
                    }
                }
            }
            EntityPayload::Todo(row) => {
                self.observe_clock(row.clock);
                let entry = self.todos.entry(row.id).or_insert_with(|| TodoState::from_row(row));
                entry.merge_row(row)?;
                if op == Operation::Delete {
                    entry.deleted = max_stamp(entry.deleted, Some(todo_stamp(row)));
                }
            }
            EntityPayload::Profile(profile) => match op {
                Operation::Insert | Operation::Update => {
                    self.profiles.insert(profile.user_id, profile.clone());
                }
                Operation::Delete => {
                    self.profiles.remove(&profile.user_id);
                }
            },
        }
        Ok(())
    }

    fn mark_deleted(&mut self, lab: Lab) {
        self.deleted = true;
        self.lab = Some(lab);
        self.members.clear();
        self.profiles.clear();
        self.whiteboards.clear();
        self.strokes.clear();
        self.messages = OrderedLog::new();
        self.todos.clear();
    }

    fn observe_clock(&mut self, clock: u64) {
        self.max_clock = self.max_clock.max(clock);
    }

    /// A clock value newer than anything this state has seen.
    pub fn next_clock(&self) -> u64 {
        self.max_clock.saturating_add(1)
    }

    pub fn is_archived(&self) -> bool {
        self.lab.as_ref().is_some_and(|lab| lab.archived)
    }

    /// Active membership of `user_id`, if any.
    pub fn membership(&self, user_id: &Uuid) -> Option<Membership> {
        self.members
            .get(user_id)
            .filter(|state| state.is_active())
            .map(MembershipState::to_membership)
    }

    pub fn role_of(&self, user_id: &Uuid) -> Option<Role> {
        self.membership(user_id).map(|membership| membership.role)
    }

    pub fn active_members(&self) -> impl Iterator<Item = Membership> + '_ {
        self.members
            .values()
            .filter(|state| state.is_active())
            .map(MembershipState::to_membership)
    }

    pub fn owner_ids(&self) -> Vec<Uuid> {
        self.active_members()
            .filter(|membership| membership.role == Role::Owner)
            .map(|membership| membership.user_id)
            .collect()
    }

    pub fn todo(&self, todo_id: &Uuid) -> Option<Todo> {
        self.todos.get(todo_id).filter(|state| state.is_visible()).map(TodoState::to_todo)
    }

    pub fn visible_todos(&self) -> Vec<Todo> {
        self.todos.values().filter(|state| state.is_visible()).map(TodoState::to_todo).collect()
    }

    pub fn stroke(&self, stroke_id: &Uuid) -> Option<&Stroke> {
        self.strokes.values().find_map(|log| log.get(stroke_id))
    }

    /// Strokes that are drawn on the whiteboard: erase markers and the
    /// strokes they target are excluded.
    pub fn visible_strokes(&self, whiteboard_id: &Uuid) -> Vec<&Stroke> {
        let Some(log) = self.strokes.get(whiteboard_id) else {
            return Vec::new();
        };
        let erased: BTreeSet<Uuid> = log.iter().filter_map(|stroke| stroke.erases).collect();
        log.iter()
            .filter(|stroke| !stroke.is_erase_marker() && !erased.contains(&stroke.id))
            .collect()
    }

    pub fn chat_log(&self) -> impl Iterator<Item = &ChatMessage> + '_ {
        self.messages.iter()
    }

    /// Whether the entity currently exists in this state.
    pub fn contains(&self, entity: EntityRef) -> bool {
        match entity.kind {
            EntityKind::Lab => entity.id == self.lab_id && self.lab.is_some() && !self.deleted,
            EntityKind::Membership => self.membership(&entity.id).is_some(),
            EntityKind::Whiteboard => self.whiteboards.contains_key(&entity.id),
            EntityKind::Stroke => self.stroke(&entity.id).is_some(),
            EntityKind::ChatMessage => self.messages.contains(&entity.id),
            EntityKind::Todo => self.todo(&entity.id).is_some(),
            EntityKind::Profile => self.profiles.contains_key(&entity.id),
        }
    }

    /// Entities whose state differs between `self` and `other`.
    pub fn changed_entities(&self, other: &LabState) -> BTreeSet<EntityRef> {
        let mut changed = BTreeSet::new();

        if self.lab != other.lab || self.deleted != other.deleted {
            changed.insert(EntityRef::new(EntityKind::Lab, other.lab_id));
        }
        diff_maps(&self.members, &other.members, EntityKind::Membership, &mut changed);
        diff_maps(&self.profiles, &other.profiles, EntityKind::Profile, &mut changed);
        diff_maps(&self.whiteboards, &other.whiteboards, EntityKind::Whiteboard, &mut changed);
        diff_maps(&self.todos, &other.todos, EntityKind::Todo, &mut changed);

        let stroke_ids = |state: &LabState| -> BTreeMap<Uuid, Stroke> {
            state
                .strokes
                .values()
                .flat_map(|log| log.ids().copied().zip(log.iter().cloned()))
                .collect()
        };
        diff_maps(&stroke_ids(self), &stroke_ids(other), EntityKind::Stroke, &mut changed);

        let message_ids = |state: &LabState| -> BTreeMap<Uuid, ChatMessage> {
            state.messages.ids().copied().zip(state.messages.iter().cloned()).collect()
        };
        diff_maps(&message_ids(self), &message_ids(other), EntityKind::ChatMessage, &mut changed);

        changed
    }
}

fn diff_maps<V: PartialEq>(
    left: &BTreeMap<Uuid, V>,
    right: &BTreeMap<Uuid, V>,
    kind: EntityKind,
    out: &mut BTreeSet<EntityRef>,
) {
    for (id, value) in left {
        if right.get(id) != Some(value) {
            out.insert(EntityRef::new(kind, *id));
        }
    }
    for id in right.keys() {
        if !left.contains_key(id) {
            out.insert(EntityRef::new(kind, *id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(seq: i64, op: Operation, payload: EntityPayload) -> ChangeEvent {
        ChangeEvent {
            lab_id: id(100),
            seq,
            entity_id: payload.entity_id(),
            op,
            payload,
            committed_at: at(seq),
        }
    }

    fn todo(done: bool, clock: u64, author: Uuid) -> EntityPayload {
        EntityPayload::Todo(Todo {
            id: id(7),
            lab_id: id(100),
            text: "calibrate laser".into(),
            done,
            clock,
            modified_by: author,
        })
    }

    fn member(user: Uuid, role: Role, clock: u64, changed_by: Uuid) -> EntityPayload {
        EntityPayload::Membership(Membership {
            lab_id: id(100),
            user_id: user,
            role,
            clock,
            changed_by,
            joined_at: at(0),
        })
    }

    #[test]
    fn later_todo_toggle_wins_regardless_of_arrival_order() {
        let a = id(1);
        let b = id(2);
        let create = event(1, Operation::Insert, todo(false, 1, a));
        let from_a = event(2, Operation::Update, todo(true, 5, a));
        let from_b = event(3, Operation::Update, todo(false, 6, b));

        let mut forward = LabState::new(id(100));
        for e in [&create, &from_a, &from_b] {
            forward.apply_event(e).unwrap();
        }
        let mut reverse = LabState::new(id(100));
        for e in [&create, &from_b, &from_a] {
            reverse.apply_event(e).unwrap();
        }

        assert_eq!(forward, reverse);
        assert_eq!(forward.todo(&id(7)).map(|t| t.done), Some(false));
        assert_eq!(forward.todo(&id(7)).map(|t| t.modified_by), Some(b));
    }

    #[test]
    fn todo_delete_is_last_writer_wins() {
        let a = id(1);
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, todo(false, 1, a))).unwrap();
        state.apply_event(&event(2, Operation::Delete, todo(false, 4, a))).unwrap();
        assert!(state.todo(&id(7)).is_none());

        // An older toggle delivered late does not resurrect it.
        state.apply_event(&event(3, Operation::Update, todo(true, 3, a))).unwrap();
        assert!(state.todo(&id(7)).is_none());
    }

    #[test]
    fn membership_removal_and_role_change_commute() {
        let owner = id(1);
        let user = id(2);
        let join = event(1, Operation::Insert, member(user, Role::Member, 1, owner));
        let promote = event(2, Operation::Update, member(user, Role::Admin, 2, owner));
        let remove = event(3, Operation::Delete, member(user, Role::Admin, 3, owner));

        let mut forward = LabState::new(id(100));
        for e in [&join, &promote, &remove] {
            forward.apply_event(e).unwrap();
        }
        let mut shuffled = LabState::new(id(100));
        for e in [&remove, &join, &promote] {
            shuffled.apply_event(e).unwrap();
        }

        assert_eq!(forward, shuffled);
        assert!(forward.membership(&user).is_none());
    }

    #[test]
    fn rejoin_after_removal_reactivates_membership() {
        let owner = id(1);
        let user = id(2);
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, member(user, Role::Member, 1, owner))).unwrap();
        state.apply_event(&event(2, Operation::Delete, member(user, Role::Member, 2, owner))).unwrap();
        state.apply_event(&event(3, Operation::Insert, member(user, Role::Member, 3, owner))).unwrap();

        assert_eq!(state.role_of(&user), Some(Role::Member));
    }

    #[test]
    fn erase_hides_target_without_removing_history() {
        let author = id(1);
        let wb = id(50);
        let stroke = |stroke_id: Uuid, clock: u64, erases: Option<Uuid>| {
            EntityPayload::Stroke(Stroke {
                id: stroke_id,
                whiteboard_id: wb,
                lab_id: id(100),
                author_id: author,
                geometry: json!({"points": [[0, 0], [1, 1]]}),
                clock,
                author_seq: clock,
                erases,
            })
        };
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, stroke(id(60), 1, None))).unwrap();
        state.apply_event(&event(2, Operation::Insert, stroke(id(61), 2, None))).unwrap();
        state.apply_event(&event(3, Operation::Insert, stroke(id(62), 3, Some(id(60))))).unwrap();

        let visible: Vec<Uuid> = state.visible_strokes(&wb).iter().map(|s| s.id).collect();
        assert_eq!(visible, vec![id(61)]);
        assert!(state.stroke(&id(60)).is_some());
    }

    #[test]
    fn optimistic_message_is_replaced_by_committed_copy() {
        let author = id(1);
        let mut state = LabState::new(id(100));
        let edit = LocalEdit::PostMessage {
            message_id: id(70),
            text: "sample ready".into(),
            clock: 4,
            author_seq: 0,
        };
        state.apply_local_edit(author, &edit, at(10)).unwrap();
        assert_eq!(state.chat_log().next().map(|m| m.seq), Some(0));

        let committed = state.plan_edit(author, &edit, at(10)).remove(0).1;
        state.apply_event(&event(9, Operation::Insert, committed)).unwrap();

        let log: Vec<&ChatMessage> = state.chat_log().collect();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].seq, 9);
    }

    #[test]
    fn edits_against_missing_entities_plan_nothing() {
        let state = LabState::new(id(100));
        let edit = LocalEdit::SetTodoDone { todo_id: id(404), done: true, clock: 2 };
        assert!(state.plan_edit(id(1), &edit, at(0)).is_empty());
    }

    #[test]
    fn lab_delete_clears_owned_entities_and_ignores_later_rows() {
        let owner = id(1);
        let lab = Lab { id: id(100), name: "Optics".into(), owner_id: owner, archived: false };
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, EntityPayload::Lab(lab.clone()))).unwrap();
        state.apply_event(&event(2, Operation::Insert, todo(false, 1, owner))).unwrap();
        state.apply_event(&event(3, Operation::Delete, EntityPayload::Lab(lab))).unwrap();
        state.apply_event(&event(4, Operation::Update, todo(true, 2, owner))).unwrap();

        assert!(state.deleted);
        assert!(state.todos.is_empty());
        assert!(!state.contains(EntityRef::new(EntityKind::Lab, id(100))));
    }

    #[test]
    fn changed_entities_reports_only_differences() {
        let author = id(1);
        let mut before = LabState::new(id(100));
        before.apply_event(&event(1, Operation::Insert, todo(false, 1, author))).unwrap();
        let mut after = before.clone();
        after.apply_event(&event(2, Operation::Update, todo(true, 2, author))).unwrap();
        after
            .apply_event(&event(3, Operation::Insert, member(author, Role::Owner, 1, author)))
            .unwrap();

        let changed = before.changed_entities(&after);
        assert_eq!(
            changed,
            BTreeSet::from([
                EntityRef::new(EntityKind::Membership, author),
                EntityRef::new(EntityKind::Todo, id(7)),
            ])
        );
    }

    #[test]
    fn next_clock_exceeds_every_observed_clock() {
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, todo(false, 41, id(1)))).unwrap();
        assert_eq!(state.next_clock(), 42);
    }

    #[test]
    fn next_clock_saturates_at_the_maximum() {
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, todo(false, u64::MAX, id(1)))).unwrap();
        assert_eq!(state.next_clock(), u64::MAX);
    }

    #[test]
    fn state_survives_a_serde_round_trip() {
        let mut state = LabState::new(id(100));
        state.apply_event(&event(1, Operation::Insert, todo(false, 1, id(1)))).unwrap();
        state
            .apply_event(&event(2, Operation::Insert, member(id(1), Role::Owner, 1, id(1))))
            .unwrap();

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: LabState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }
}
