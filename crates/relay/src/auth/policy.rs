// Row-level read and write rules for lab data.
//
// Reads are decided per event per subscriber against the membership the
// directory holds at delivery time. Writes are checked against the lab's
// materialized state before an edit is forwarded to the store.

use labsync_common::error::RejectReason;
use labsync_common::state::LabState;
use labsync_common::types::{ChangeEvent, EntityKind, EntityPayload, LocalEdit, Membership, Role};
use uuid::Uuid;

/// Author recorded on mutations the relay makes on its own behalf, such as
/// ownership transfers.
pub const SYSTEM_ACTOR: Uuid = Uuid::nil();

pub const MAX_NAME_CHARS: usize = 200;
pub const MAX_MESSAGE_CHARS: usize = 4_000;
pub const MAX_TODO_CHARS: usize = 1_000;
/// How far past the lab's next clock an edit may stamp itself.
pub const MAX_CLOCK_LEAD: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deliver,
    Redact,
    Drop,
}

pub fn filter(event: &ChangeEvent, membership: Option<&Membership>) -> Decision {
    let Some(membership) = membership else {
        return Decision::Drop;
    };
    if membership.lab_id != event.lab_id {
        return Decision::Drop;
    }

    match &event.payload {
        EntityPayload::Profile(profile) if profile.user_id != membership.user_id => Decision::Redact,
        _ => Decision::Deliver,
    }
}

/// Copy of `event` with fields other members may not see removed.
pub fn redact(event: &ChangeEvent) -> ChangeEvent {
    let mut redacted = event.clone();
    if let EntityPayload::Profile(profile) = &event.payload {
        redacted.payload = EntityPayload::Profile(profile.redacted());
    }
    redacted
}

/// The event as `membership` may see it, or `None` when it must be dropped.
pub fn project(event: &ChangeEvent, membership: Option<&Membership>) -> Option<ChangeEvent> {
    match filter(event, membership) {
        Decision::Deliver => Some(event.clone()),
        Decision::Redact => Some(redact(event)),
        Decision::Drop => None,
    }
}

pub fn filter_presence(lab_id: Uuid, membership: Option<&Membership>) -> bool {
    membership.is_some_and(|membership| membership.lab_id == lab_id)
}

/// Full-state snapshot as `viewer` may see it.
pub fn redact_state(state: &LabState, viewer: Uuid) -> LabState {
    let mut visible = state.clone();
    for (user_id, profile) in visible.profiles.iter_mut() {
        if *user_id != viewer {
            *profile = profile.redacted();
        }
    }
    visible
}

/// Whether `edit` is a resend of an insert `actor` already had committed.
pub fn is_replayed_insert(actor: Uuid, edit: &LocalEdit, state: &LabState) -> bool {
    match edit {
        LocalEdit::DrawStroke { stroke_id, .. } | LocalEdit::EraseStroke { stroke_id, .. } => {
            state.stroke(stroke_id).is_some_and(|stroke| stroke.author_id == actor)
        }
        LocalEdit::PostMessage { message_id, .. } => state
            .messages
            .get(message_id)
            .is_some_and(|message| message.author_id == actor),
        _ => false,
    }
}

pub fn authorize_edit(
    membership: Option<&Membership>,
    edit: &LocalEdit,
    state: &LabState,
) -> Result<(), RejectReason> {
    if state.deleted {
        return Err(RejectReason::LabDeleted);
    }
    let Some(membership) = membership.filter(|membership| membership.lab_id == state.lab_id) else {
        return Err(RejectReason::NotAMember);
    };
    if state.is_archived() && !matches!(edit, LocalEdit::DeleteLab) {
        return Err(RejectReason::LabArchived);
    }
    if let Some(clock) = edit.clock() {
        validate_clock(clock, state)?;
    }

    let actor = membership.user_id;
    let role = membership.role;

    match edit {
        LocalEdit::CreateWhiteboard { whiteboard_id, name } => {
            validate_text("whiteboard name", name, MAX_NAME_CHARS)?;
            if state.whiteboards.contains_key(whiteboard_id) {
                return Err(invalid("whiteboard already exists"));
            }
            Ok(())
        }
        LocalEdit::DrawStroke { stroke_id, whiteboard_id, geometry, .. } => {
            require_whiteboard(state, *whiteboard_id)?;
            if geometry.is_null() {
                return Err(invalid("stroke geometry is required"));
            }
            if state.stroke(stroke_id).is_some() {
                return Err(invalid("stroke already exists"));
            }
            Ok(())
        }
        LocalEdit::EraseStroke { stroke_id, whiteboard_id, target_stroke_id, .. } => {
            require_whiteboard(state, *whiteboard_id)?;
            if state.stroke(stroke_id).is_some() {
                return Err(invalid("stroke already exists"));
            }
            let target = state
                .stroke(target_stroke_id)
                .filter(|target| target.whiteboard_id == *whiteboard_id)
                .ok_or(RejectReason::UnknownEntity {
                    kind: EntityKind::Stroke,
                    id: *target_stroke_id,
                })?;
            if target.is_erase_marker() {
                return Err(invalid("an erase cannot itself be erased"));
            }
            if target.author_id != actor && !role.is_manager() {
                return Err(RejectReason::NotAuthor { kind: EntityKind::Stroke });
            }
            Ok(())
        }
        LocalEdit::PostMessage { message_id, text, .. } => {
            validate_text("message", text, MAX_MESSAGE_CHARS)?;
            if state.messages.contains(message_id) {
                return Err(invalid("message already exists"));
            }
            Ok(())
        }
        LocalEdit::CreateTodo { todo_id, text, .. } => {
            validate_text("todo", text, MAX_TODO_CHARS)?;
            if state.todos.contains_key(todo_id) {
                return Err(invalid("todo already exists"));
            }
            Ok(())
        }
        LocalEdit::SetTodoDone { todo_id, .. } => require_todo(state, *todo_id),
        LocalEdit::DeleteTodo { todo_id, .. } => {
            require_todo(state, *todo_id)?;
            require_role(role, Role::Admin)
        }
        LocalEdit::SetMemberRole { user_id, role: new_role, .. } => {
            let target = require_member(state, *user_id)?;
            if *user_id == actor {
                return Err(RejectReason::SelfRoleChange);
            }
            require_role(role, Role::Admin)?;
            if target.role == Role::Owner && role != Role::Owner {
                return Err(RejectReason::OwnerProtected);
            }
            if *new_role == Role::Owner {
                require_role(role, Role::Owner)?;
            }
            Ok(())
        }
        LocalEdit::RemoveMember { user_id, .. } => {
            let target = require_member(state, *user_id)?;
            if *user_id == actor {
                return Ok(());
            }
            require_role(role, Role::Admin)?;
            if target.role == Role::Owner && role != Role::Owner {
                return Err(RejectReason::OwnerProtected);
            }
            Ok(())
        }
        LocalEdit::RenameLab { name } => {
            require_lab(state)?;
            require_role(role, Role::Admin)?;
            validate_text("lab name", name, MAX_NAME_CHARS)
        }
        LocalEdit::DeleteLab => {
            require_lab(state)?;
            require_role(role, Role::Owner)
        }
    }
}

/// Who inherits the lab when `departing` leaves it without an owner: the
/// longest-standing admin, else the longest-standing member. Ties go to the
/// lower user id.
pub fn successor_owner(state: &LabState, departing: Uuid) -> Option<Uuid> {
    let candidates: Vec<Membership> =
        state.active_members().filter(|membership| membership.user_id != departing).collect();

    let senior = |role: Role| {
        candidates
            .iter()
            .filter(|membership| membership.role == role)
            .min_by_key(|membership| (membership.joined_at, membership.user_id))
            .map(|membership| membership.user_id)
    };

    senior(Role::Admin).or_else(|| senior(Role::Member))
}

fn require_role(role: Role, required: Role) -> Result<(), RejectReason> {
    if role.allows(required) {
        Ok(())
    } else {
        Err(RejectReason::InsufficientRole { required })
    }
}

fn require_lab(state: &LabState) -> Result<(), RejectReason> {
    if state.lab.is_some() {
        Ok(())
    } else {
        Err(RejectReason::UnknownEntity { kind: EntityKind::Lab, id: state.lab_id })
    }
}

fn require_whiteboard(state: &LabState, whiteboard_id: Uuid) -> Result<(), RejectReason> {
    if state.whiteboards.contains_key(&whiteboard_id) {
        Ok(())
    } else {
        Err(RejectReason::UnknownEntity { kind: EntityKind::Whiteboard, id: whiteboard_id })
    }
}

fn require_todo(state: &LabState, todo_id: Uuid) -> Result<(), RejectReason> {
    if state.todo(&todo_id).is_some() {
        Ok(())
    } else {
        Err(RejectReason::UnknownEntity { kind: EntityKind::Todo, id: todo_id })
    }
}

fn require_member(state: &LabState, user_id: Uuid) -> Result<Membership, RejectReason> {
    state
        .membership(&user_id)
        .ok_or(RejectReason::UnknownEntity { kind: EntityKind::Membership, id: user_id })
}

fn validate_text(field: &str, value: &str, max_chars: usize) -> Result<(), RejectReason> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    if value.chars().count() > max_chars {
        return Err(invalid(format!("{field} exceeds {max_chars} characters")));
    }
    Ok(())
}

fn validate_clock(clock: u64, state: &LabState) -> Result<(), RejectReason> {
    let limit = state.next_clock().saturating_add(MAX_CLOCK_LEAD);
    if clock == 0 || clock > limit {
        return Err(invalid(format!("clock {clock} is outside 1..={limit}")));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> RejectReason {
    RejectReason::Invalid { message: message.into() }
}
