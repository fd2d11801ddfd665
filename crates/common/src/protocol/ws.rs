// WebSocket message types for the labsync.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RejectReason;
use crate::state::LabState;
use crate::types::{ChangeEvent, LocalEdit, PresenceState, Role};

/// The current (latest) protocol version.
pub const CURRENT_PROTOCOL_VERSION: &str = "labsync.v1";

/// Every version the relay accepts, newest first. Index 1 is the N-1 slot.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION, "labsync.v0"];

/// Frames larger than this close the socket.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// All message types in the labsync.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: initial handshake.
    Hello { session_token: String },

    /// Server -> Client: handshake acknowledgement.
    HelloAck {
        server_time: String,
        lab_id: Uuid,
        user_id: Uuid,
        role: Role,
        heartbeat_interval_ms: u64,
    },

    /// Client -> Server: request replay after the last applied sequence.
    Resume {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seq: Option<i64>,
    },

    /// Server -> Client: ordered events after the requested sequence.
    Backlog { events: Vec<ChangeEvent>, head_seq: i64 },

    /// Server -> Client: full lab state, sent when the backlog was compacted.
    Snapshot { state: Box<LabState>, seq: i64 },

    /// Server -> Client: one live change event.
    Event { event: ChangeEvent },

    /// Server -> Client: presence transition of a lab member.
    Presence { user_id: Uuid, state: PresenceState },

    /// Server -> Client: the session fell behind and must resume.
    ResyncRequired { after_seq: i64 },

    /// Client -> Server: liveness signal.
    Heartbeat,

    /// Client -> Server: an optimistic edit.
    LocalEdit { edit_id: Uuid, edit: LocalEdit },

    /// Server -> Client: the edit was accepted and forwarded to the store.
    Ack { edit_id: Uuid },

    /// Server -> Client: the edit was refused.
    Rejected { edit_id: Uuid, reason: RejectReason },

    /// Client -> Server: explicit departure.
    Leave,

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        lab_id: Option<Uuid>,
    },
}

impl WsMessage {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::HelloAck { .. } => "hello_ack",
            Self::Resume { .. } => "resume",
            Self::Backlog { .. } => "backlog",
            Self::Snapshot { .. } => "snapshot",
            Self::Event { .. } => "event",
            Self::Presence { .. } => "presence",
            Self::ResyncRequired { .. } => "resync_required",
            Self::Heartbeat => "heartbeat",
            Self::LocalEdit { .. } => "local_edit",
            Self::Ack { .. } => "ack",
            Self::Rejected { .. } => "rejected",
            Self::Leave => "leave",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_are_tagged_by_type() {
        let message = WsMessage::ResyncRequired { after_seq: 41 };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"type": "resync_required", "after_seq": 41}));
        assert_eq!(message.type_name(), "resync_required");
    }

    #[test]
    fn resume_without_sequence_omits_the_field() {
        let value = serde_json::to_value(WsMessage::Resume { last_seq: None }).unwrap();
        assert_eq!(value, json!({"type": "resume"}));

        let decoded: WsMessage = serde_json::from_value(json!({"type": "resume"})).unwrap();
        assert_eq!(decoded, WsMessage::Resume { last_seq: None });
    }

    #[test]
    fn local_edit_frame_nests_the_tagged_edit() {
        let raw = json!({
            "type": "local_edit",
            "edit_id": "00000000-0000-0000-0000-00000000000a",
            "edit": {"op": "set_todo_done", "todo_id": "00000000-0000-0000-0000-000000000007", "done": true, "clock": 6}
        });
        let decoded: WsMessage = serde_json::from_value(raw).unwrap();
        match decoded {
            WsMessage::LocalEdit { edit: LocalEdit::SetTodoDone { done, clock, .. }, .. } => {
                assert!(done);
                assert_eq!(clock, 6);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn current_version_leads_supported_list() {
        assert_eq!(SUPPORTED_PROTOCOL_VERSIONS[0], CURRENT_PROTOCOL_VERSION);
        assert_eq!(SUPPORTED_PROTOCOL_VERSIONS.len(), 2);
    }
}
