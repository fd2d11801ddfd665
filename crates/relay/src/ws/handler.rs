use super::protocol as ws_protocol;
use super::session::{SessionTickets, TicketValidation};
use crate::auth::{
    jwt::JwtAccessTokenService,
    middleware::{require_bearer_auth, AuthenticatedUser},
};
use crate::channel::SessionHandle;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::hub::{EditOutcome, LabHub};
use crate::protocol;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, Path, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use labsync_common::protocol::ws::{WsMessage, MAX_FRAME_BYTES};
use labsync_common::types::Role;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct WsState {
    hub: Arc<LabHub>,
    tickets: SessionTickets,
    ws_base_url: Arc<str>,
    heartbeat_interval: Duration,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub protocol: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub session_token: String,
    pub ws_url: String,
    pub heartbeat_interval_ms: u64,
    pub max_frame_bytes: usize,
}

pub fn router(
    jwt_service: Arc<JwtAccessTokenService>,
    hub: Arc<LabHub>,
    tickets: SessionTickets,
    ws_base_url: String,
    heartbeat_interval: Duration,
) -> Router {
    let state = WsState {
        hub,
        tickets,
        ws_base_url: Arc::<str>::from(ws_base_url),
        heartbeat_interval,
    };
    let auth_layer = middleware::from_fn_with_state(jwt_service, require_bearer_auth);

    Router::new()
        .route("/v1/labs/{lab_id}/sessions", post(create_session).route_layer(auth_layer))
        .route("/v1/ws/{session_id}", get(ws_upgrade))
        .with_state(state)
}

pub async fn create_session(
    Path(lab_id): Path<Uuid>,
    Extension(user): Extension<AuthenticatedUser>,
    State(state): State<WsState>,
    Json(payload): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    if let Err(upgrade_error) = protocol::require_supported(&payload.protocol) {
        return upgrade_error.into_response();
    }

    match state.hub.membership(lab_id, user.user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return RelayError::new(ErrorCode::AuthForbidden, "caller is not a member of this lab")
                .into_response();
        }
        Err(error) => {
            error!(error = ?error, user_id = %user.user_id, lab_id = %lab_id, "failed to evaluate lab membership");
            return RelayError::from(error).into_response();
        }
    }

    let (session_id, session_token) = state.tickets.issue(lab_id, user.user_id, Utc::now()).await;
    let ws_url = format!("{}/v1/ws/{}", state.ws_base_url, session_id);

    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            session_token,
            ws_url,
            heartbeat_interval_ms: state.heartbeat_interval.as_millis() as u64,
            max_frame_bytes: MAX_FRAME_BYTES,
        }),
    )
        .into_response()
}

pub async fn ws_upgrade(
    Path(session_id): Path<Uuid>,
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.tickets.exists(session_id).await {
        return RelayError::from_code(ErrorCode::NotFound).into_response();
    }

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, session_id, socket)).await;
        },
    )
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
                .into(),
        })))
        .await;
}

async fn reject_and_close(socket: &mut WebSocket, frame: WsMessage) {
    let _ = ws_protocol::send_ws_message(socket, &frame).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Wait for the `hello` frame and redeem its token.
async fn await_hello(
    state: &WsState,
    session_id: Uuid,
    socket: &mut WebSocket,
) -> Option<(Uuid, Uuid)> {
    let deadline = state.hub.config().heartbeat_timeout;
    let first = match tokio::time::timeout(deadline, socket.recv()).await {
        Ok(Some(Ok(Message::Text(raw)))) => raw,
        Ok(Some(Err(error))) if is_frame_size_violation(&error) => {
            close_frame_too_large(socket).await;
            return None;
        }
        Ok(None) | Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(_))) | Err(_) => {
            let frame = ws_protocol::error_frame(
                "SYNC_HELLO_REQUIRED",
                "first WebSocket message must be a hello frame",
                false,
                None,
            );
            reject_and_close(socket, frame).await;
            return None;
        }
    };

    let session_token = match ws_protocol::decode_message(&first) {
        Ok(WsMessage::Hello { session_token }) => session_token,
        _ => {
            let frame = ws_protocol::error_frame(
                "SYNC_HELLO_REQUIRED",
                "first WebSocket message must be a hello frame",
                false,
                None,
            );
            reject_and_close(socket, frame).await;
            return None;
        }
    };

    match state.tickets.redeem(session_id, &session_token, Utc::now()).await {
        TicketValidation::Valid { lab_id, user_id } => Some((lab_id, user_id)),
        TicketValidation::Invalid => {
            let frame =
                ws_protocol::error_frame("SYNC_TOKEN_INVALID", "invalid session token", false, None);
            reject_and_close(socket, frame).await;
            None
        }
        TicketValidation::Expired => {
            let frame =
                ws_protocol::error_frame("SYNC_TOKEN_EXPIRED", "session token expired", true, None);
            reject_and_close(socket, frame).await;
            None
        }
    }
}

async fn handle_socket(state: WsState, session_id: Uuid, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    let Some((lab_id, user_id)) = await_hello(&state, session_id, &mut socket).await else {
        return;
    };

    let (mut session, role) = match subscribe(&state, lab_id, user_id).await {
        Ok(opened) => opened,
        Err(error) => {
            let frame = ws_protocol::relay_error_frame(&error, lab_id);
            reject_and_close(&mut socket, frame).await;
            state.tickets.release(session_id).await;
            return;
        }
    };

    info!(
        request_id = %request_id,
        session_id = %session.session_id(),
        lab_id = %lab_id,
        user_id = %user_id,
        "websocket session opened"
    );

    let hello_ack = WsMessage::HelloAck {
        server_time: Utc::now().to_rfc3339(),
        lab_id,
        user_id,
        role,
        heartbeat_interval_ms: state.heartbeat_interval.as_millis() as u64,
    };
    if ws_protocol::send_ws_message(&mut socket, &hello_ack).await.is_ok() {
        run_session(&state, &mut session, &mut socket).await;
    }

    state.hub.unsubscribe(&session).await;
    state.tickets.release(session_id).await;
    debug!(request_id = %request_id, lab_id = %lab_id, "websocket session closed");
}

async fn subscribe(
    state: &WsState,
    lab_id: Uuid,
    user_id: Uuid,
) -> Result<(SessionHandle, Role), RelayError> {
    let Some(membership) = state.hub.membership(lab_id, user_id).await? else {
        return Err(RelayError::new(ErrorCode::AuthForbidden, "caller is not a member of this lab"));
    };
    let handle = state.hub.subscribe(lab_id, user_id).await?;
    Ok((handle, membership.role))
}

enum Flow {
    Continue,
    Stop,
}

async fn run_session(state: &WsState, session: &mut SessionHandle, socket: &mut WebSocket) {
    let lab_id = session.lab_id();
    let mut ping = tokio::time::interval(state.heartbeat_interval);
    ping.reset();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            outbound = session.next() => {
                match outbound {
                    Some(event) => {
                        let frame = ws_protocol::session_frame(event);
                        if ws_protocol::send_ws_message(socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if let Some(reason) = session.close_reason() {
                            info!(lab_id = %lab_id, session_id = %session.session_id(), reason = reason.as_str(), "closing websocket session");
                            reject_and_close(socket, ws_protocol::close_frame(reason, lab_id)).await;
                        }
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                let Some(message) = inbound else {
                    break;
                };
                match message {
                    Ok(Message::Text(raw)) => {
                        state.hub.heartbeat(session).await;
                        if let Flow::Stop = handle_frame(state, session, socket, &raw).await {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        state.hub.heartbeat(session).await;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => state.hub.heartbeat(session).await,
                    Ok(Message::Binary(_)) => {
                        let frame = ws_protocol::error_frame(
                            "SYNC_INVALID_MESSAGE",
                            "binary frames are not supported",
                            false,
                            Some(lab_id),
                        );
                        if ws_protocol::send_ws_message(socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(socket).await;
                        } else {
                            warn!(lab_id = %lab_id, error = %error, "websocket receive failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    state: &WsState,
    session: &mut SessionHandle,
    socket: &mut WebSocket,
    raw: &str,
) -> Flow {
    let lab_id = session.lab_id();
    let inbound = match ws_protocol::decode_message(raw) {
        Ok(message) => message,
        Err(_) => {
            let frame = ws_protocol::error_frame(
                "SYNC_INVALID_MESSAGE",
                "invalid websocket frame payload",
                false,
                Some(lab_id),
            );
            return send_or_stop(socket, &frame).await;
        }
    };

    match inbound {
        WsMessage::Resume { last_seq } => {
            if last_seq.is_some_and(|seq| seq < 0) {
                let error = RelayError::new(ErrorCode::ValidationFailed, "last_seq must not be negative");
                return send_or_stop(socket, &ws_protocol::relay_error_frame(&error, lab_id)).await;
            }
            match state.hub.reconcile(session, last_seq).await {
                Ok(reply) => {
                    if let Flow::Stop = send_or_stop(socket, &ws_protocol::reconcile_frame(reply)).await {
                        return Flow::Stop;
                    }
                    let presence = match state.hub.get_presence(lab_id, session.user_id()).await {
                        Ok(presence) => presence,
                        Err(error) => {
                            let error = RelayError::from(error);
                            return send_or_stop(socket, &ws_protocol::relay_error_frame(&error, lab_id)).await;
                        }
                    };
                    for entry in presence {
                        let frame = WsMessage::Presence { user_id: entry.user_id, state: entry.state };
                        if let Flow::Stop = send_or_stop(socket, &frame).await {
                            return Flow::Stop;
                        }
                    }
                    Flow::Continue
                }
                Err(error) => {
                    let error = RelayError::from(error);
                    send_or_stop(socket, &ws_protocol::relay_error_frame(&error, lab_id)).await
                }
            }
        }
        WsMessage::Heartbeat => Flow::Continue,
        WsMessage::LocalEdit { edit_id, edit } => {
            match state.hub.publish_local_edit(session, edit_id, edit).await {
                Ok(EditOutcome::Ack) => send_or_stop(socket, &WsMessage::Ack { edit_id }).await,
                Ok(EditOutcome::Rejected(reason)) => {
                    send_or_stop(socket, &WsMessage::Rejected { edit_id, reason }).await
                }
                Err(error) => {
                    let error = RelayError::from(error);
                    send_or_stop(socket, &ws_protocol::relay_error_frame(&error, lab_id)).await
                }
            }
        }
        WsMessage::Leave => Flow::Stop,
        other => {
            let frame = ws_protocol::error_frame(
                "SYNC_UNSUPPORTED_MESSAGE",
                format!("unexpected {} frame from client", other.type_name()),
                false,
                Some(lab_id),
            );
            send_or_stop(socket, &frame).await
        }
    }
}

async fn send_or_stop(socket: &mut WebSocket, frame: &WsMessage) -> Flow {
    match ws_protocol::send_ws_message(socket, frame).await {
        Ok(()) => Flow::Continue,
        Err(()) => Flow::Stop,
    }
}
