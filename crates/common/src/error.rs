// Error taxonomy shared by the relay and its clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crdt::MergeConflict;
use crate::types::{EntityKind, Role};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Missing or invalid membership. Terminal for the request.
    #[error("user {user_id} is not a member of lab {lab_id}")]
    Unauthorized { lab_id: Uuid, user_id: Uuid },

    /// Two writes to a mutable field could not be ordered.
    #[error(transparent)]
    Conflict(#[from] MergeConflict),

    /// The requested replay range is no longer retained.
    #[error("backlog for lab {lab_id} no longer covers sequence {requested_after} (oldest retained {oldest_retained})")]
    BacklogUnavailable { lab_id: Uuid, requested_after: i64, oldest_retained: i64 },

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: &'static str, after_ms: u64 },
}

impl SyncError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Conflict(_) => "SYNC_CONFLICT",
            Self::BacklogUnavailable { .. } => "BACKLOG_UNAVAILABLE",
            Self::Timeout { .. } => "SYNC_TIMEOUT",
        }
    }

    /// Whether a client should retry after backing off.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::BacklogUnavailable { .. } | Self::Timeout { .. })
    }
}

/// Why the relay refused a local edit. Sent back in `rejected` frames.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("not a member of this lab")]
    NotAMember,
    #[error("requires the {required} role")]
    InsufficientRole { required: Role },
    #[error("only the author may change this {kind}")]
    NotAuthor { kind: EntityKind },
    #[error("the owner's membership can only be changed by the owner")]
    OwnerProtected,
    #[error("members cannot change their own role")]
    SelfRoleChange,
    #[error("lab is archived")]
    LabArchived,
    #[error("lab has been deleted")]
    LabDeleted,
    #[error("{kind} {id} does not exist")]
    UnknownEntity { kind: EntityKind, id: Uuid },
    #[error("invalid edit: {message}")]
    Invalid { message: String },
}

impl RejectReason {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotAMember => "not_a_member",
            Self::InsufficientRole { .. } => "insufficient_role",
            Self::NotAuthor { .. } => "not_author",
            Self::OwnerProtected => "owner_protected",
            Self::SelfRoleChange => "self_role_change",
            Self::LabArchived => "lab_archived",
            Self::LabDeleted => "lab_deleted",
            Self::UnknownEntity { .. } => "unknown_entity",
            Self::Invalid { .. } => "invalid",
        }
    }
}
