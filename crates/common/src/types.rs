// Core domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Role a user holds inside a lab. Ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }

    /// True when this role grants at least the privileges of `required`.
    pub fn allows(self, required: Role) -> bool {
        self >= required
    }

    /// Owners and admins manage the lab on behalf of everyone else.
    pub fn is_manager(self) -> bool {
        self.allows(Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lab is the unit of isolation for authorization and sequencing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lab {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    #[serde(default)]
    pub archived: bool,
}

/// The (lab, user, role) authorization record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub lab_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    /// Logical clock of the last role change.
    #[serde(default)]
    pub clock: u64,
    /// User who made the last role change.
    pub changed_by: Uuid,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Whiteboard {
    pub id: Uuid,
    pub lab_id: Uuid,
    pub name: String,
}

/// One committed pen stroke. Never updated; an erase is a new stroke whose
/// `erases` points at the stroke it hides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stroke {
    pub id: Uuid,
    pub whiteboard_id: Uuid,
    pub lab_id: Uuid,
    pub author_id: Uuid,
    pub geometry: serde_json::Value,
    /// Per-whiteboard logical clock at the time the stroke was drawn.
    pub clock: u64,
    /// Author-local sequence used to break clock ties.
    pub author_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erases: Option<Uuid>,
}

impl Stroke {
    pub fn is_erase_marker(&self) -> bool {
        self.erases.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub lab_id: Uuid,
    pub author_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub clock: u64,
    #[serde(default)]
    pub author_seq: u64,
    /// Per-lab sequence number, stamped when the message is captured.
    #[serde(default)]
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Todo {
    pub id: Uuid,
    pub lab_id: Uuid,
    pub text: String,
    pub done: bool,
    /// Logical clock of the last modification.
    pub clock: u64,
    pub modified_by: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserProfile {
    /// The view of this profile other lab members are allowed to see.
    pub fn redacted(&self) -> Self {
        Self { user_id: self.user_id, display_name: self.display_name.clone(), email: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lab,
    Membership,
    Whiteboard,
    Stroke,
    ChatMessage,
    Todo,
    Profile,
}

impl EntityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lab => "lab",
            Self::Membership => "membership",
            Self::Whiteboard => "whiteboard",
            Self::Stroke => "stroke",
            Self::ChatMessage => "chat_message",
            Self::Todo => "todo",
            Self::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one entity inside a lab. Memberships and profiles are keyed by
/// user id; labs by their own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub const fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Typed row image carried by a change event. Only subscriber-relevant
/// fields exist here; anything else in the source row is discarded when the
/// row is deserialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    Lab(Lab),
    Membership(Membership),
    Whiteboard(Whiteboard),
    Stroke(Stroke),
    ChatMessage(ChatMessage),
    Todo(Todo),
    Profile(UserProfile),
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Lab(_) => EntityKind::Lab,
            Self::Membership(_) => EntityKind::Membership,
            Self::Whiteboard(_) => EntityKind::Whiteboard,
            Self::Stroke(_) => EntityKind::Stroke,
            Self::ChatMessage(_) => EntityKind::ChatMessage,
            Self::Todo(_) => EntityKind::Todo,
            Self::Profile(_) => EntityKind::Profile,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::Lab(lab) => lab.id,
            Self::Membership(membership) => membership.user_id,
            Self::Whiteboard(whiteboard) => whiteboard.id,
            Self::Stroke(stroke) => stroke.id,
            Self::ChatMessage(message) => message.id,
            Self::Todo(todo) => todo.id,
            Self::Profile(profile) => profile.user_id,
        }
    }

    /// Owning lab, when the row itself names one. Profiles are not lab-scoped.
    pub fn lab_id(&self) -> Option<Uuid> {
        match self {
            Self::Lab(lab) => Some(lab.id),
            Self::Membership(membership) => Some(membership.lab_id),
            Self::Whiteboard(whiteboard) => Some(whiteboard.lab_id),
            Self::Stroke(stroke) => Some(stroke.lab_id),
            Self::ChatMessage(message) => Some(message.lab_id),
            Self::Todo(todo) => Some(todo.lab_id),
            Self::Profile(_) => None,
        }
    }
}

/// A normalized, sequenced notification of a single entity mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub lab_id: Uuid,
    pub seq: i64,
    pub entity_id: Uuid,
    pub op: Operation,
    pub payload: EntityPayload,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Offline,
    Connecting,
    Online,
}

impl PresenceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
        }
    }
}

/// A presence transition for one user in one lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceChange {
    pub lab_id: Uuid,
    pub user_id: Uuid,
    pub state: PresenceState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub state: PresenceState,
}

/// An optimistic edit a client applies locally and submits to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LocalEdit {
    CreateWhiteboard {
        whiteboard_id: Uuid,
        name: String,
    },
    DrawStroke {
        stroke_id: Uuid,
        whiteboard_id: Uuid,
        geometry: serde_json::Value,
        clock: u64,
        author_seq: u64,
    },
    EraseStroke {
        stroke_id: Uuid,
        whiteboard_id: Uuid,
        target_stroke_id: Uuid,
        clock: u64,
        author_seq: u64,
    },
    PostMessage {
        message_id: Uuid,
        text: String,
        clock: u64,
        author_seq: u64,
    },
    CreateTodo {
        todo_id: Uuid,
        text: String,
        clock: u64,
    },
    SetTodoDone {
        todo_id: Uuid,
        done: bool,
        clock: u64,
    },
    DeleteTodo {
        todo_id: Uuid,
        clock: u64,
    },
    SetMemberRole {
        user_id: Uuid,
        role: Role,
        clock: u64,
    },
    RemoveMember {
        user_id: Uuid,
        clock: u64,
    },
    RenameLab {
        name: String,
    },
    DeleteLab,
}

impl LocalEdit {
    /// The entity this edit writes.
    pub fn target(&self, lab_id: Uuid) -> EntityRef {
        match self {
            Self::CreateWhiteboard { whiteboard_id, .. } => {
                EntityRef::new(EntityKind::Whiteboard, *whiteboard_id)
            }
            Self::DrawStroke { stroke_id, .. } | Self::EraseStroke { stroke_id, .. } => {
                EntityRef::new(EntityKind::Stroke, *stroke_id)
            }
            Self::PostMessage { message_id, .. } => {
                EntityRef::new(EntityKind::ChatMessage, *message_id)
            }
            Self::CreateTodo { todo_id, .. }
            | Self::SetTodoDone { todo_id, .. }
            | Self::DeleteTodo { todo_id, .. } => EntityRef::new(EntityKind::Todo, *todo_id),
            Self::SetMemberRole { user_id, .. } | Self::RemoveMember { user_id, .. } => {
                EntityRef::new(EntityKind::Membership, *user_id)
            }
            Self::RenameLab { .. } | Self::DeleteLab => EntityRef::new(EntityKind::Lab, lab_id),
        }
    }

    /// Logical clock the edit carries. Whiteboard creation and lab-level
    /// edits have none.
    pub const fn clock(&self) -> Option<u64> {
        match self {
            Self::DrawStroke { clock, .. }
            | Self::EraseStroke { clock, .. }
            | Self::PostMessage { clock, .. }
            | Self::CreateTodo { clock, .. }
            | Self::SetTodoDone { clock, .. }
            | Self::DeleteTodo { clock, .. }
            | Self::SetMemberRole { clock, .. }
            | Self::RemoveMember { clock, .. } => Some(*clock),
            Self::CreateWhiteboard { .. } | Self::RenameLab { .. } | Self::DeleteLab => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateWhiteboard { .. } => "create_whiteboard",
            Self::DrawStroke { .. } => "draw_stroke",
            Self::EraseStroke { .. } => "erase_stroke",
            Self::PostMessage { .. } => "post_message",
            Self::CreateTodo { .. } => "create_todo",
            Self::SetTodoDone { .. } => "set_todo_done",
            Self::DeleteTodo { .. } => "delete_todo",
            Self::SetMemberRole { .. } => "set_member_role",
            Self::RemoveMember { .. } => "remove_member",
            Self::RenameLab { .. } => "rename_lab",
            Self::DeleteLab => "delete_lab",
        }
    }
}
