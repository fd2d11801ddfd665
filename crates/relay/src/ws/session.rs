// Short-lived tickets binding a WebSocket session id to the lab and user
// that created it over authenticated REST.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

pub(crate) const SESSION_TOKEN_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
struct SessionTicket {
    lab_id: Uuid,
    user_id: Uuid,
    session_token: String,
    expires_at: DateTime<Utc>,
    active_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketValidation {
    Valid { lab_id: Uuid, user_id: Uuid },
    Invalid,
    Expired,
}

#[derive(Debug, Clone, Default)]
pub struct SessionTickets {
    tickets: Arc<RwLock<HashMap<Uuid, SessionTicket>>>,
}

impl SessionTickets {
    /// Issue a ticket for `user_id` on `lab_id`. Returns the session id and
    /// the token the client must present in its `hello` frame.
    pub async fn issue(&self, lab_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> (Uuid, String) {
        let session_id = Uuid::new_v4();
        let session_token = Uuid::new_v4().to_string();
        self.tickets.write().await.insert(
            session_id,
            SessionTicket {
                lab_id,
                user_id,
                session_token: session_token.clone(),
                expires_at: now + Duration::minutes(SESSION_TOKEN_TTL_MINUTES),
                active_connections: 0,
            },
        );
        (session_id, session_token)
    }

    pub async fn exists(&self, session_id: Uuid) -> bool {
        self.tickets.read().await.contains_key(&session_id)
    }

    /// Check the token presented for `session_id` and count the connection.
    pub async fn redeem(&self, session_id: Uuid, session_token: &str, now: DateTime<Utc>) -> TicketValidation {
        let mut guard = self.tickets.write().await;
        let Some(ticket) = guard.get_mut(&session_id) else {
            return TicketValidation::Invalid;
        };
        if ticket.session_token != session_token {
            return TicketValidation::Invalid;
        }
        if now > ticket.expires_at {
            return TicketValidation::Expired;
        }
        ticket.active_connections += 1;
        TicketValidation::Valid { lab_id: ticket.lab_id, user_id: ticket.user_id }
    }

    pub async fn release(&self, session_id: Uuid) {
        if let Some(ticket) = self.tickets.write().await.get_mut(&session_id) {
            ticket.active_connections = ticket.active_connections.saturating_sub(1);
        }
    }

    /// Forget expired tickets that have no open connection.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.tickets.write().await;
        let before = guard.len();
        guard.retain(|_, ticket| ticket.active_connections > 0 || now <= ticket.expires_at);
        before - guard.len()
    }

    pub async fn active_connections(&self, session_id: Uuid) -> Option<usize> {
        self.tickets.read().await.get(&session_id).map(|ticket| ticket.active_connections)
    }
}
