// Presence tracking per (lab, user).
//
// offline -> connecting (subscribe) -> online (first heartbeat) -> offline
// (leave or heartbeat timeout). A user with several connections stays in
// their current state until the last connection is gone.

use chrono::{DateTime, Duration, Utc};
use labsync_common::types::{PresenceChange, PresenceEntry, PresenceState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    users: Arc<RwLock<HashMap<(Uuid, Uuid), UserPresence>>>,
}

#[derive(Debug, Clone)]
struct UserPresence {
    state: PresenceState,
    connections: HashMap<Uuid, ConnectionEntry>,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionEntry {
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

/// A connection the sweep found silent for longer than the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredConnection {
    pub lab_id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub changes: Vec<PresenceChange>,
    pub expired: Vec<ExpiredConnection>,
}

impl PresenceTracker {
    pub async fn begin_connect(
        &self,
        lab_id: Uuid,
        user_id: Uuid,
        connection_id: Uuid,
        now: DateTime<Utc>,
    ) -> Option<PresenceChange> {
        let mut guard = self.users.write().await;
        let user = guard
            .entry((lab_id, user_id))
            .or_insert_with(|| UserPresence { state: PresenceState::Offline, connections: HashMap::new() });
        user.connections
            .insert(connection_id, ConnectionEntry { connected_at: now, last_heartbeat: now });

        (user.state == PresenceState::Offline).then(|| {
            user.state = PresenceState::Connecting;
            change(lab_id, user_id, PresenceState::Connecting, now)
        })
    }

    /// Record liveness for a connection. Unknown connections are ignored.
    pub async fn heartbeat(
        &self,
        lab_id: Uuid,
        user_id: Uuid,
        connection_id: Uuid,
        now: DateTime<Utc>,
    ) -> Option<PresenceChange> {
        let mut guard = self.users.write().await;
        let user = guard.get_mut(&(lab_id, user_id))?;
        let connection = user.connections.get_mut(&connection_id)?;
        connection.last_heartbeat = now;

        (user.state == PresenceState::Connecting).then(|| {
            user.state = PresenceState::Online;
            change(lab_id, user_id, PresenceState::Online, now)
        })
    }

    pub async fn leave(
        &self,
        lab_id: Uuid,
        user_id: Uuid,
        connection_id: Uuid,
        now: DateTime<Utc>,
    ) -> Option<PresenceChange> {
        let mut guard = self.users.write().await;
        let user = guard.get_mut(&(lab_id, user_id))?;
        user.connections.remove(&connection_id)?;
        if !user.connections.is_empty() {
            return None;
        }
        guard.remove(&(lab_id, user_id));
        Some(change(lab_id, user_id, PresenceState::Offline, now))
    }

    /// Drop every connection whose last heartbeat is older than `timeout`.
    pub async fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> SweepResult {
        let mut result = SweepResult::default();
        let mut guard = self.users.write().await;

        guard.retain(|(lab_id, user_id), user| {
            user.connections.retain(|connection_id, entry| {
                let alive = now - entry.last_heartbeat <= timeout;
                if !alive {
                    result.expired.push(ExpiredConnection {
                        lab_id: *lab_id,
                        user_id: *user_id,
                        connection_id: *connection_id,
                    });
                }
                alive
            });
            if user.connections.is_empty() {
                result.changes.push(change(*lab_id, *user_id, PresenceState::Offline, now));
                return false;
            }
            true
        });

        result
    }

    pub async fn state_of(&self, lab_id: Uuid, user_id: Uuid) -> PresenceState {
        self.users
            .read()
            .await
            .get(&(lab_id, user_id))
            .map(|user| user.state)
            .unwrap_or(PresenceState::Offline)
    }

    /// Every user of the lab that is not offline, ordered by user id.
    pub async fn snapshot(&self, lab_id: Uuid) -> Vec<PresenceEntry> {
        let guard = self.users.read().await;
        let mut entries: Vec<PresenceEntry> = guard
            .iter()
            .filter(|((lab, _), _)| *lab == lab_id)
            .map(|((_, user_id), user)| PresenceEntry { user_id: *user_id, state: user.state })
            .collect();
        entries.sort_by_key(|entry| entry.user_id);
        entries
    }

    /// When the user's oldest live connection was opened.
    pub async fn connected_since(&self, lab_id: Uuid, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.users
            .read()
            .await
            .get(&(lab_id, user_id))
            .and_then(|user| user.connections.values().map(|entry| entry.connected_at).min())
    }

    pub async fn forget_user(&self, lab_id: Uuid, user_id: Uuid) {
        self.users.write().await.remove(&(lab_id, user_id));
    }

    pub async fn forget_lab(&self, lab_id: Uuid) {
        self.users.write().await.retain(|(lab, _), _| *lab != lab_id);
    }
}

fn change(lab_id: Uuid, user_id: Uuid, state: PresenceState, at: DateTime<Utc>) -> PresenceChange {
    PresenceChange { lab_id, user_id, state, at }
}
