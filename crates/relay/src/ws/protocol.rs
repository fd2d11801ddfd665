use axum::extract::ws::{Message, WebSocket};
use labsync_common::protocol::ws::WsMessage;
use labsync_common::sync::ReconcileReply;
use uuid::Uuid;

use crate::channel::{CloseReason, SessionEvent};
use crate::error::RelayError;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

pub fn error_frame(code: &str, message: impl Into<String>, retryable: bool, lab_id: Option<Uuid>) -> WsMessage {
    WsMessage::Error { code: code.to_owned(), message: message.into(), retryable, lab_id }
}

/// The relay error envelope as an `error` frame.
pub fn relay_error_frame(error: &RelayError, lab_id: Uuid) -> WsMessage {
    error_frame(error.code().as_str(), error.message(), error.code().retryable(), Some(lab_id))
}

pub fn session_frame(event: SessionEvent) -> WsMessage {
    match event {
        SessionEvent::Event(event) => WsMessage::Event { event },
        SessionEvent::Presence(change) => {
            WsMessage::Presence { user_id: change.user_id, state: change.state }
        }
        SessionEvent::ResyncRequired { after_seq } => WsMessage::ResyncRequired { after_seq },
    }
}

pub fn reconcile_frame(reply: ReconcileReply) -> WsMessage {
    match reply {
        ReconcileReply::Backlog { events, head_seq } => WsMessage::Backlog { events, head_seq },
        ReconcileReply::Snapshot { state, seq } => WsMessage::Snapshot { state: Box::new(state), seq },
    }
}

/// Final frame sent when the hub closed the session.
pub fn close_frame(reason: CloseReason, lab_id: Uuid) -> WsMessage {
    let (code, message, retryable) = match reason {
        CloseReason::Unsubscribed => ("SYNC_UNSUBSCRIBED", "session was closed", true),
        CloseReason::MembershipRevoked => {
            ("SYNC_MEMBERSHIP_REVOKED", "membership in this lab was revoked", false)
        }
        CloseReason::LabDeleted => ("SYNC_LAB_DELETED", "lab has been deleted", false),
        CloseReason::HeartbeatTimeout => {
            ("SYNC_HEARTBEAT_TIMEOUT", "no heartbeat within the timeout", true)
        }
    };
    error_frame(code, message, retryable, Some(lab_id))
}
