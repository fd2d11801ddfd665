// Per-lab channel multiplexer.
//
// Each subscribed session owns a bounded queue. Publishing never waits on a
// slow session: a full queue marks the session degraded, it receives nothing
// further, and its stream yields `ResyncRequired` once the queued events have
// been drained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use labsync_common::state::LabState;
use labsync_common::types::{ChangeEvent, PresenceChange};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::policy;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(ChangeEvent),
    Presence(PresenceChange),
}

/// Item yielded by [`SessionHandle::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Event(ChangeEvent),
    Presence(PresenceChange),
    /// The session dropped events and must reconcile from `after_seq`.
    ResyncRequired { after_seq: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    MembershipRevoked,
    LabDeleted,
    HeartbeatTimeout,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::MembershipRevoked => "membership_revoked",
            Self::LabDeleted => "lab_deleted",
            Self::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

#[derive(Debug, Default)]
struct SessionShared {
    degraded: AtomicBool,
    notify: Notify,
    close_reason: OnceLock<CloseReason>,
}

#[derive(Debug)]
struct SessionSlot {
    user_id: Uuid,
    sender: mpsc::Sender<Delivery>,
    shared: Arc<SessionShared>,
}

#[derive(Debug)]
pub struct LabChannel {
    lab_id: Uuid,
    buffer: usize,
    sessions: RwLock<HashMap<Uuid, SessionSlot>>,
}

impl LabChannel {
    pub fn new(lab_id: Uuid, buffer: usize) -> Self {
        Self { lab_id, buffer: buffer.max(1), sessions: RwLock::new(HashMap::new()) }
    }

    /// Register a session. Its stream starts after `head_seq`.
    pub async fn attach(&self, session_id: Uuid, user_id: Uuid, head_seq: i64) -> SessionHandle {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let shared = Arc::new(SessionShared::default());
        self.sessions
            .write()
            .await
            .insert(session_id, SessionSlot { user_id, sender, shared: Arc::clone(&shared) });

        SessionHandle {
            session_id,
            lab_id: self.lab_id,
            user_id,
            receiver,
            shared,
            last_seq: head_seq,
            resync_signalled: false,
        }
    }

    /// Remove a session and release its queue. Returns false when it was
    /// already gone.
    pub async fn detach(&self, session_id: Uuid) -> bool {
        self.close_session(session_id, CloseReason::Unsubscribed).await
    }

    pub async fn close_session(&self, session_id: Uuid, reason: CloseReason) -> bool {
        let Some(slot) = self.sessions.write().await.remove(&session_id) else {
            return false;
        };
        let _ = slot.shared.close_reason.set(reason);
        slot.shared.notify.notify_one();
        true
    }

    /// Close every session `user_id` holds in this lab.
    pub async fn close_user(&self, user_id: Uuid, reason: CloseReason) -> Vec<Uuid> {
        let mut sessions = self.sessions.write().await;
        let closed: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, slot)| slot.user_id == user_id)
            .map(|(session_id, _)| *session_id)
            .collect();
        for session_id in &closed {
            if let Some(slot) = sessions.remove(session_id) {
                let _ = slot.shared.close_reason.set(reason);
                slot.shared.notify.notify_one();
            }
        }
        closed
    }

    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let mut sessions = self.sessions.write().await;
        let closed = sessions.len();
        for (_, slot) in sessions.drain() {
            let _ = slot.shared.close_reason.set(reason);
            slot.shared.notify.notify_one();
        }
        closed
    }

    /// Deliver `event` to every session whose member may see it. `directory`
    /// is the lab state membership is resolved against.
    pub async fn publish(&self, event: &ChangeEvent, directory: &LabState) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (session_id, slot) in sessions.iter() {
            let membership = directory.membership(&slot.user_id);
            let Some(visible) = policy::project(event, membership.as_ref()) else {
                debug!(
                    lab_id = %self.lab_id,
                    session_id = %session_id,
                    seq = event.seq,
                    "event filtered for session"
                );
                continue;
            };
            if self.offer(*session_id, slot, Delivery::Event(visible)) {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn publish_presence(&self, change: &PresenceChange, directory: &LabState) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (session_id, slot) in sessions.iter() {
            let membership = directory.membership(&slot.user_id);
            if !policy::filter_presence(change.lab_id, membership.as_ref()) {
                continue;
            }
            if self.offer(*session_id, slot, Delivery::Presence(change.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_degraded(&self, session_id: Uuid) -> Option<bool> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|slot| slot.shared.degraded.load(Ordering::SeqCst))
    }

    fn offer(&self, session_id: Uuid, slot: &SessionSlot, delivery: Delivery) -> bool {
        if slot.shared.degraded.load(Ordering::SeqCst) {
            return false;
        }
        match slot.sender.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                slot.shared.degraded.store(true, Ordering::SeqCst);
                slot.shared.notify.notify_one();
                warn!(
                    lab_id = %self.lab_id,
                    session_id = %session_id,
                    user_id = %slot.user_id,
                    buffer = self.buffer,
                    "session buffer full, marking degraded"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// One subscription's lazy, restartable stream of lab events.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: Uuid,
    lab_id: Uuid,
    user_id: Uuid,
    receiver: mpsc::Receiver<Delivery>,
    shared: Arc<SessionShared>,
    last_seq: i64,
    resync_signalled: bool,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn lab_id(&self) -> Uuid {
        self.lab_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Sequence of the last event this stream yielded.
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.get().copied()
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    /// Next item of the stream. Returns `None` once the session has been
    /// closed and its queue drained.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(delivery) => return Some(self.track(delivery)),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if self.shared.close_reason.get().is_some() {
                return None;
            }
            if self.is_degraded() && !self.resync_signalled {
                self.resync_signalled = true;
                return Some(SessionEvent::ResyncRequired { after_seq: self.last_seq });
            }

            tokio::select! {
                delivery = self.receiver.recv() => match delivery {
                    Some(delivery) => return Some(self.track(delivery)),
                    None => return None,
                },
                _ = self.shared.notify.notified() => {}
            }
        }
    }

    /// Discard everything queued. Used when a reconcile reply supersedes it.
    pub(crate) fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Resume live delivery after a reconcile reply covering `head_seq`.
    pub(crate) fn resynced(&mut self, head_seq: i64) {
        self.last_seq = head_seq;
        self.resync_signalled = false;
        self.shared.degraded.store(false, Ordering::SeqCst);
    }

    fn track(&mut self, delivery: Delivery) -> SessionEvent {
        match delivery {
            Delivery::Event(event) => {
                self.last_seq = event.seq;
                SessionEvent::Event(event)
            }
            Delivery::Presence(change) => SessionEvent::Presence(change),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use labsync_common::types::{
        EntityPayload, Membership, Operation, PresenceState, Role, Todo,
    };

    const LAB: Uuid = Uuid::from_u128(0x1AB);

    fn user(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn directory(members: &[(u128, Role)]) -> LabState {
        let mut state = LabState::new(LAB);
        for (index, (n, role)) in members.iter().enumerate() {
            let payload = EntityPayload::Membership(Membership {
                lab_id: LAB,
                user_id: user(*n),
                role: *role,
                clock: 1,
                changed_by: user(1),
                joined_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            });
            state
                .apply_event(&ChangeEvent {
                    lab_id: LAB,
                    seq: index as i64 + 1,
                    entity_id: payload.entity_id(),
                    op: Operation::Insert,
                    payload,
                    committed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                })
                .unwrap();
        }
        state
    }

    fn todo_event(seq: i64) -> ChangeEvent {
        let todo = Todo {
            id: Uuid::from_u128(0x70),
            lab_id: LAB,
            text: "mount optics".into(),
            done: seq % 2 == 0,
            clock: seq as u64,
            modified_by: user(1),
        };
        ChangeEvent {
            lab_id: LAB,
            seq,
            entity_id: todo.id,
            op: Operation::Update,
            payload: EntityPayload::Todo(todo),
            committed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn members_receive_events_in_order_and_outsiders_nothing() {
        let channel = LabChannel::new(LAB, 16);
        let directory = directory(&[(1, Role::Owner)]);
        let mut member = channel.attach(Uuid::new_v4(), user(1), 0).await;
        let mut outsider = channel.attach(Uuid::new_v4(), user(9), 0).await;

        for seq in 1..=3 {
            channel.publish(&todo_event(seq), &directory).await;
        }

        for expected in 1..=3 {
            match member.next().await {
                Some(SessionEvent::Event(event)) => assert_eq!(event.seq, expected),
                other => panic!("unexpected item {other:?}"),
            }
        }
        assert_eq!(member.last_seq(), 3);

        channel.close_all(CloseReason::LabDeleted).await;
        assert_eq!(outsider.next().await, None);
        assert_eq!(outsider.close_reason(), Some(CloseReason::LabDeleted));
    }

    #[tokio::test]
    async fn full_buffer_degrades_and_signals_resync_after_drain() {
        let channel = LabChannel::new(LAB, 2);
        let directory = directory(&[(1, Role::Member)]);
        let session_id = Uuid::new_v4();
        let mut handle = channel.attach(session_id, user(1), 0).await;

        for seq in 1..=4 {
            channel.publish(&todo_event(seq), &directory).await;
        }
        assert_eq!(channel.is_degraded(session_id).await, Some(true));

        assert!(matches!(handle.next().await, Some(SessionEvent::Event(e)) if e.seq == 1));
        assert!(matches!(handle.next().await, Some(SessionEvent::Event(e)) if e.seq == 2));
        assert_eq!(handle.next().await, Some(SessionEvent::ResyncRequired { after_seq: 2 }));

        channel.publish(&todo_event(5), &directory).await;
        handle.resynced(5);
        channel.publish(&todo_event(6), &directory).await;
        assert!(matches!(handle.next().await, Some(SessionEvent::Event(e)) if e.seq == 6));
    }

    #[tokio::test]
    async fn closing_a_user_ends_only_their_streams_after_queued_events() {
        let channel = LabChannel::new(LAB, 8);
        let directory = directory(&[(1, Role::Admin), (2, Role::Member)]);
        let mut admin = channel.attach(Uuid::new_v4(), user(1), 0).await;
        let mut member = channel.attach(Uuid::new_v4(), user(2), 0).await;

        channel.publish(&todo_event(1), &directory).await;
        let closed = channel.close_user(user(2), CloseReason::MembershipRevoked).await;
        assert_eq!(closed.len(), 1);
        channel.publish(&todo_event(2), &directory).await;

        assert!(matches!(member.next().await, Some(SessionEvent::Event(e)) if e.seq == 1));
        assert_eq!(member.next().await, None);
        assert_eq!(member.close_reason(), Some(CloseReason::MembershipRevoked));

        assert!(matches!(admin.next().await, Some(SessionEvent::Event(e)) if e.seq == 1));
        assert!(matches!(admin.next().await, Some(SessionEvent::Event(e)) if e.seq == 2));
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let channel = LabChannel::new(LAB, 8);
        let session_id = Uuid::new_v4();
        let _handle = channel.attach(session_id, user(1), 0).await;

        assert!(channel.detach(session_id).await);
        assert!(!channel.detach(session_id).await);
        assert_eq!(channel.session_count().await, 0);
    }

    #[tokio::test]
    async fn presence_reaches_members_only() {
        let channel = LabChannel::new(LAB, 8);
        let directory = directory(&[(1, Role::Member)]);
        let mut member = channel.attach(Uuid::new_v4(), user(1), 0).await;
        let _outsider = channel.attach(Uuid::new_v4(), user(9), 0).await;

        let change = PresenceChange {
            lab_id: LAB,
            user_id: user(1),
            state: PresenceState::Online,
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        assert_eq!(channel.publish_presence(&change, &directory).await, 1);
        assert_eq!(member.next().await, Some(SessionEvent::Presence(change)));
    }
}
