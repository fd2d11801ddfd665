// In-process sync hub: one commit lane, backlog and channel per lab.
//
// Captured mutations are deduplicated, normalized and committed here. A
// commit stamps the next sequence number, folds the event into the lab's
// backlog and fans it out to the lab's sessions, all under the lab's lane.
// Edits from sessions are authorized against the backlog's state and handed
// to the edit sink; their authoritative events come back through `ingest`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use labsync_common::error::{RejectReason, SyncError};
use labsync_common::state::LabState;
use labsync_common::sync::ReconcileReply;
use labsync_common::types::{
    ChangeEvent, EntityKind, EntityPayload, Lab, LocalEdit, Membership, Operation,
    PresenceChange, PresenceEntry, PresenceState, Role,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::policy::{self, SYSTEM_ACTOR};
use crate::capture::{normalize, table_kind, CaptureError, CapturedChange, DedupeWindow, RawMutation};
use crate::channel::{CloseReason, LabChannel, SessionHandle};
use crate::presence::PresenceTracker;
use crate::store::{EditSink, Forwarded, LabStore};
use crate::sync::{LabBacklog, LabSequencer};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub session_buffer: usize,
    pub backlog_capacity: usize,
    pub backlog_fetch_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub dedupe_window: usize,
    /// How long a deleted lab keeps discarding late mutations.
    pub tombstone_retention: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_buffer: 256,
            backlog_capacity: 4_096,
            backlog_fetch_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            dedupe_window: 65_536,
            tombstone_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Ack,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Events sequenced, including profile fan-out and relay follow-ups.
    pub committed: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

#[derive(Debug)]
struct LabEntry {
    lane: Mutex<()>,
    backlog: RwLock<LabBacklog>,
    channel: LabChannel,
}

impl LabEntry {
    fn new(backlog: LabBacklog, session_buffer: usize) -> Self {
        let channel = LabChannel::new(backlog.lab_id(), session_buffer);
        Self { lane: Mutex::new(()), backlog: RwLock::new(backlog), channel }
    }
}

#[derive(Debug)]
pub struct LabHub {
    config: HubConfig,
    store: LabStore,
    sink: EditSink,
    sequencer: LabSequencer,
    labs: RwLock<HashMap<Uuid, Arc<LabEntry>>>,
    deleted_labs: RwLock<HashMap<Uuid, DateTime<Utc>>>,
    dedupe: Mutex<DedupeWindow>,
    presence: PresenceTracker,
}

impl LabHub {
    pub fn new(config: HubConfig, store: LabStore, sink: EditSink) -> Self {
        let dedupe = Mutex::new(DedupeWindow::new(config.dedupe_window));
        Self {
            config,
            store,
            sink,
            sequencer: LabSequencer::new(),
            labs: RwLock::new(HashMap::new()),
            deleted_labs: RwLock::new(HashMap::new()),
            dedupe,
            presence: PresenceTracker::default(),
        }
    }

    /// Hub without a database: labs exist only through ingested mutations
    /// and accepted edits loop straight back into `ingest`.
    pub fn in_memory(config: HubConfig) -> Self {
        Self::new(config, LabStore::Memory, EditSink::Loopback)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &LabStore {
        &self.store
    }

    pub fn sequencer(&self) -> &LabSequencer {
        &self.sequencer
    }

    /// Open a session on `lab_id` for `user_id`. Requires an active membership.
    pub async fn subscribe(&self, lab_id: Uuid, user_id: Uuid) -> Result<SessionHandle, HubError> {
        let unauthorized = SyncError::Unauthorized { lab_id, user_id };
        let Some(entry) = self.lookup(lab_id, false).await? else {
            return Err(unauthorized.into());
        };

        let session_id = Uuid::new_v4();
        let handle = {
            let _lane = entry.lane.lock().await;
            let handle = {
                let backlog = entry.backlog.read().await;
                if backlog.state().membership(&user_id).is_none() {
                    return Err(unauthorized.into());
                }
                entry.channel.attach(session_id, user_id, backlog.head_seq()).await
            };
            // Under the lane so a concurrent removal cannot be overtaken.
            if let Some(change) =
                self.presence.begin_connect(lab_id, user_id, session_id, Utc::now()).await
            {
                self.broadcast_presence(&entry, &change).await;
            }
            handle
        };

        info!(
            lab_id = %lab_id,
            user_id = %user_id,
            session_id = %session_id,
            head_seq = handle.last_seq(),
            "session subscribed"
        );
        Ok(handle)
    }

    /// Close the session and release its buffer. Safe to call repeatedly.
    pub async fn unsubscribe(&self, handle: &SessionHandle) {
        let lab_id = handle.lab_id();
        let Some(entry) = self.labs.read().await.get(&lab_id).cloned() else {
            return;
        };
        let detached = entry.channel.detach(handle.session_id()).await;
        if let Some(change) = self
            .presence
            .leave(lab_id, handle.user_id(), handle.session_id(), Utc::now())
            .await
        {
            self.broadcast_presence(&entry, &change).await;
        }
        if detached {
            debug!(lab_id = %lab_id, session_id = %handle.session_id(), "session unsubscribed");
        }
    }

    /// Liveness signal from a session's client.
    pub async fn heartbeat(&self, handle: &SessionHandle) {
        let lab_id = handle.lab_id();
        let Some(change) = self
            .presence
            .heartbeat(lab_id, handle.user_id(), handle.session_id(), Utc::now())
            .await
        else {
            return;
        };
        if let Some(entry) = self.labs.read().await.get(&lab_id).cloned() {
            self.broadcast_presence(&entry, &change).await;
        }
    }

    pub async fn membership(&self, lab_id: Uuid, user_id: Uuid) -> Result<Option<Membership>, HubError> {
        let Some(entry) = self.lookup(lab_id, false).await? else {
            return Ok(None);
        };
        let backlog = entry.backlog.read().await;
        Ok(backlog.state().membership(&user_id))
    }

    /// Presence of every connected user of the lab, as `user_id` may see it.
    pub async fn get_presence(&self, lab_id: Uuid, user_id: Uuid) -> Result<Vec<PresenceEntry>, HubError> {
        let unauthorized = SyncError::Unauthorized { lab_id, user_id };
        let Some(entry) = self.lookup(lab_id, false).await? else {
            return Err(unauthorized.into());
        };
        let present = self.presence.snapshot(lab_id).await;

        let backlog = entry.backlog.read().await;
        let state = backlog.state();
        if state.membership(&user_id).is_none() {
            return Err(unauthorized.into());
        }
        Ok(present
            .into_iter()
            .filter(|present| state.membership(&present.user_id).is_some())
            .collect())
    }

    /// Labs currently loaded in which `user_id` holds an active membership.
    pub async fn labs_of(&self, user_id: Uuid) -> Vec<Uuid> {
        let entries: Vec<Arc<LabEntry>> = self.labs.read().await.values().cloned().collect();
        let mut labs = Vec::new();
        for entry in entries {
            let backlog = entry.backlog.read().await;
            if backlog.state().membership(&user_id).is_some() {
                labs.push(backlog.lab_id());
            }
        }
        labs.sort();
        labs
    }

    pub async fn is_deleted(&self, lab_id: Uuid) -> bool {
        self.deleted_labs.read().await.contains_key(&lab_id)
    }

    /// Authorize an optimistic edit and forward it to the store. The
    /// resulting event reaches subscribers through the capture feed.
    pub async fn publish_local_edit(
        &self,
        handle: &SessionHandle,
        edit_id: Uuid,
        edit: LocalEdit,
    ) -> Result<EditOutcome, HubError> {
        let lab_id = handle.lab_id();
        let actor = handle.user_id();
        if self.is_deleted(lab_id).await {
            return Ok(EditOutcome::Rejected(RejectReason::LabDeleted));
        }
        let Some(entry) = self.lookup(lab_id, false).await? else {
            return Ok(EditOutcome::Rejected(RejectReason::LabDeleted));
        };

        let rows = {
            let backlog = entry.backlog.read().await;
            let state = backlog.state();
            if policy::is_replayed_insert(actor, &edit, state) {
                debug!(lab_id = %lab_id, edit_id = %edit_id, "edit already committed");
                return Ok(EditOutcome::Ack);
            }
            let membership = state.membership(&actor);
            if let Err(reason) = policy::authorize_edit(membership.as_ref(), &edit, state) {
                info!(
                    lab_id = %lab_id,
                    user_id = %actor,
                    edit_id = %edit_id,
                    edit = edit.name(),
                    reason = reason.code(),
                    "edit rejected"
                );
                return Ok(EditOutcome::Rejected(reason));
            }
            state.plan_edit(actor, &edit, Utc::now())
        };

        match self.sink.forward(lab_id, actor, edit_id, &rows).await? {
            Forwarded::Queued => {}
            Forwarded::Loopback(raws) => {
                self.ingest(raws).await;
            }
        }

        debug!(lab_id = %lab_id, edit_id = %edit_id, edit = edit.name(), rows = rows.len(), "edit forwarded");
        Ok(EditOutcome::Ack)
    }

    /// Feed raw mutations from the change feed into their labs.
    pub async fn ingest(&self, raws: Vec<RawMutation>) -> IngestReport {
        let batch = raws.len();
        async move {
            let mut report = IngestReport::default();
            let mut queue: VecDeque<RawMutation> = raws.into();

            while let Some(raw) = queue.pop_front() {
                let key = match raw.dedupe_key() {
                    Ok(key) => key,
                    Err(CaptureError::UnknownTable(table)) => {
                        debug!(table = %table, "ignoring mutation for uncaptured table");
                        report.ignored += 1;
                        continue;
                    }
                    Err(error) => {
                        warn!(table = %raw.table, commit_id = %raw.commit_id, error = %error, "dropping malformed mutation");
                        report.ignored += 1;
                        continue;
                    }
                };
                let profile_owner = (table_kind(&raw.table) == Some(EntityKind::Profile))
                    .then(|| Uuid::parse_str(&key.row_id).ok())
                    .flatten();

                if !self.dedupe.lock().await.check_and_insert(key.clone()) {
                    debug!(table = %raw.table, commit_id = %raw.commit_id, "duplicate mutation suppressed");
                    report.duplicates += 1;
                    continue;
                }

                let fan_out = match profile_owner {
                    Some(user_id) => self.labs_of(user_id).await,
                    None => Vec::new(),
                };
                let changes = match normalize(&raw, |_| fan_out) {
                    Ok(changes) => changes,
                    Err(error) => {
                        warn!(table = %raw.table, commit_id = %raw.commit_id, error = %error, "dropping malformed mutation");
                        self.dedupe.lock().await.forget(&key);
                        report.ignored += 1;
                        continue;
                    }
                };

                let mut failed = false;
                for change in changes {
                    let lab_id = change.lab_id;
                    if self.is_deleted(lab_id).await {
                        debug!(lab_id = %lab_id, "discarding mutation for deleted lab");
                        report.ignored += 1;
                        continue;
                    }
                    let entry = match self.lookup(lab_id, true).await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => {
                            report.ignored += 1;
                            continue;
                        }
                        Err(error) => {
                            error!(lab_id = %lab_id, error = ?error, "failed to load lab for capture");
                            failed = true;
                            report.ignored += 1;
                            continue;
                        }
                    };
                    queue.extend(self.commit(&entry, change).await);
                    report.committed += 1;
                }
                if failed {
                    self.dedupe.lock().await.forget(&key);
                }
            }

            report
        }
        .instrument(info_span!("relay.capture.ingest", batch))
        .await
    }

    /// Answer a session's resume request and restart its live stream after
    /// the reply's sequence number.
    pub async fn reconcile(
        &self,
        handle: &mut SessionHandle,
        last_seq: Option<i64>,
    ) -> Result<ReconcileReply, HubError> {
        let bound = self.config.backlog_fetch_timeout;
        let lab_id = handle.lab_id();
        match tokio::time::timeout(bound, self.reconcile_within(handle, last_seq)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(lab_id = %lab_id, session_id = %handle.session_id(), "backlog fetch timed out");
                Err(SyncError::Timeout {
                    operation: "backlog fetch",
                    after_ms: bound.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Drop connections that stopped heartbeating and broadcast the
    /// resulting presence changes. Also expires lab tombstones.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::milliseconds(self.config.tombstone_retention.as_millis() as i64);
        let pruned = {
            let mut deleted = self.deleted_labs.write().await;
            let before = deleted.len();
            deleted.retain(|_, deleted_at| now - *deleted_at < retention);
            before - deleted.len()
        };
        if pruned > 0 {
            debug!(pruned, "lab tombstones expired");
        }

        let timeout = chrono::Duration::milliseconds(self.config.heartbeat_timeout.as_millis() as i64);
        let result = self.presence.sweep(now, timeout).await;

        for expired in &result.expired {
            let entry = self.labs.read().await.get(&expired.lab_id).cloned();
            if let Some(entry) = entry {
                entry.channel.close_session(expired.connection_id, CloseReason::HeartbeatTimeout).await;
            }
            warn!(
                lab_id = %expired.lab_id,
                user_id = %expired.user_id,
                session_id = %expired.connection_id,
                "heartbeat timeout, session closed"
            );
        }
        for change in &result.changes {
            let entry = self.labs.read().await.get(&change.lab_id).cloned();
            if let Some(entry) = entry {
                self.broadcast_presence(&entry, change).await;
            }
        }

        result.expired.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.sweep(Utc::now()).await;
            }
        })
    }

    async fn reconcile_within(
        &self,
        handle: &mut SessionHandle,
        last_seq: Option<i64>,
    ) -> Result<ReconcileReply, HubError> {
        let lab_id = handle.lab_id();
        let viewer = handle.user_id();
        let unauthorized = SyncError::Unauthorized { lab_id, user_id: viewer };
        let Some(entry) = self.lookup(lab_id, false).await? else {
            return Err(unauthorized.into());
        };

        // Compacted ranges are read from the change log before taking the
        // lane so commits are not held up by the store.
        let compacted = {
            let backlog = entry.backlog.read().await;
            match (last_seq, backlog.reconcile_reply(last_seq)) {
                (Some(after), Err(SyncError::BacklogUnavailable { .. })) => {
                    Some((after, backlog.base_seq()))
                }
                (_, Err(error)) => return Err(error.into()),
                (_, Ok(_)) => None,
            }
        };
        let archived = match compacted {
            Some((after, upto)) => match self.store.fetch_change_log(lab_id, after, upto).await {
                Ok(events) if is_contiguous(&events, after, upto) => Some((upto, events)),
                Ok(events) => {
                    debug!(lab_id = %lab_id, after, upto, found = events.len(), "change log incomplete");
                    None
                }
                Err(error) => {
                    warn!(lab_id = %lab_id, error = ?error, "change log read failed, sending snapshot");
                    None
                }
            },
            None => None,
        };

        let _lane = entry.lane.lock().await;
        let backlog = entry.backlog.read().await;
        let Some(membership) = backlog.state().membership(&viewer) else {
            return Err(unauthorized.into());
        };

        let reply = match backlog.reconcile_reply(last_seq) {
            Ok(reply) => reply,
            Err(SyncError::BacklogUnavailable { .. }) => match archived {
                Some((upto, mut events)) => match backlog.events_after(upto) {
                    Ok(retained) => {
                        events.extend(retained);
                        ReconcileReply::Backlog { events, head_seq: backlog.head_seq() }
                    }
                    Err(_) => backlog.snapshot(),
                },
                None => backlog.snapshot(),
            },
            Err(error) => return Err(error.into()),
        };

        let reply = match reply {
            ReconcileReply::Backlog { events, head_seq } => ReconcileReply::Backlog {
                events: events
                    .iter()
                    .filter_map(|event| policy::project(event, Some(&membership)))
                    .collect(),
                head_seq,
            },
            ReconcileReply::Snapshot { state, seq } => {
                ReconcileReply::Snapshot { state: policy::redact_state(&state, viewer), seq }
            }
        };
        let (kind, head_seq) = match &reply {
            ReconcileReply::Backlog { head_seq, .. } => ("backlog", *head_seq),
            ReconcileReply::Snapshot { seq, .. } => ("snapshot", *seq),
        };

        let superseded = handle.drain();
        handle.resynced(head_seq);
        info!(
            lab_id = %lab_id,
            session_id = %handle.session_id(),
            last_seq = ?last_seq,
            head_seq,
            reply = kind,
            superseded,
            "session reconciled"
        );
        Ok(reply)
    }

    /// Stamp, retain and fan out one change. Returns follow-up mutations the
    /// relay produced in response (ownership transfer, archival).
    async fn commit(&self, entry: &LabEntry, change: CapturedChange) -> Vec<RawMutation> {
        let lab_id = change.lab_id;
        let span = info_span!(
            "relay.hub.commit",
            lab_id = %lab_id,
            kind = change.payload.kind().as_str(),
            op = change.op.as_str()
        );

        async move {
            let _lane = entry.lane.lock().await;
            let mut backlog = entry.backlog.write().await;

            let seq = self.sequencer.next_seq(lab_id).await;
            let event = ChangeEvent {
                lab_id,
                seq,
                entity_id: change.entity_id,
                op: change.op,
                payload: change.payload,
                committed_at: change.committed_at,
            };

            let member_before = match &event.payload {
                EntityPayload::Membership(row) => {
                    Some((row.user_id, backlog.state().role_of(&row.user_id)))
                }
                _ => None,
            };
            let deleting_lab =
                matches!(event.payload, EntityPayload::Lab(_)) && event.op == Operation::Delete;
            let before_delete = deleting_lab.then(|| backlog.state().clone());

            if let Err(conflict) = backlog.append(&event) {
                error!(seq, error = %conflict, "merge conflict while committing event");
            }

            // Readers proceed during the change log write; the lane keeps
            // commits for this lab ordered.
            let backlog = backlog.downgrade();
            if let Some(pool) = self.store.pool() {
                if let Err(error) = self.sequencer.persist_batch(pool, std::slice::from_ref(&event)).await {
                    error!(seq, error = ?error, "failed to persist change event");
                }
            }
            let state = backlog.state();
            let directory = before_delete.as_ref().unwrap_or(state);
            let delivered = entry.channel.publish(&event, directory).await;
            debug!(seq, delivered, "event published");

            if deleting_lab {
                drop(backlog);
                self.retire_lab(entry, lab_id).await;
                return Vec::new();
            }

            let Some((user_id, role_before)) = member_before else {
                return Vec::new();
            };
            let role_after = state.role_of(&user_id);

            if role_before.is_some() && role_after.is_none() {
                let closed = entry.channel.close_user(user_id, CloseReason::MembershipRevoked).await;
                let was_present = self.presence.connected_since(lab_id, user_id).await.is_some();
                self.presence.forget_user(lab_id, user_id).await;
                if was_present {
                    let offline = PresenceChange {
                        lab_id,
                        user_id,
                        state: PresenceState::Offline,
                        at: Utc::now(),
                    };
                    entry.channel.publish_presence(&offline, state).await;
                }
                info!(user_id = %user_id, closed = closed.len(), "membership revoked, sessions closed");
            }

            if role_before == Some(Role::Owner) && role_after != Some(Role::Owner) {
                return self.owner_departure(state, user_id).await;
            }
            Vec::new()
        }
        .instrument(span)
        .await
    }

    /// Keep the lab owned after `departing` stopped being its owner.
    async fn owner_departure(&self, state: &LabState, departing: Uuid) -> Vec<RawMutation> {
        let Some(lab) = state.lab.as_ref().filter(|_| !state.deleted) else {
            return Vec::new();
        };
        if !state.owner_ids().is_empty() {
            return Vec::new();
        }

        let heir = policy::successor_owner(state, departing).and_then(|user| state.membership(&user));
        let rows = match heir {
            Some(heir) => {
                let heir_id = heir.user_id;
                info!(lab_id = %state.lab_id, departing = %departing, heir = %heir_id, "transferring lab ownership");
                vec![
                    (
                        Operation::Update,
                        EntityPayload::Membership(Membership {
                            role: Role::Owner,
                            clock: state.next_clock(),
                            changed_by: SYSTEM_ACTOR,
                            ..heir
                        }),
                    ),
                    (Operation::Update, EntityPayload::Lab(Lab { owner_id: heir_id, ..lab.clone() })),
                ]
            }
            None if !lab.archived => {
                info!(lab_id = %state.lab_id, departing = %departing, "last member left, archiving lab");
                vec![(Operation::Update, EntityPayload::Lab(Lab { archived: true, ..lab.clone() }))]
            }
            None => return Vec::new(),
        };

        match self.sink.forward(state.lab_id, SYSTEM_ACTOR, Uuid::new_v4(), &rows).await {
            Ok(Forwarded::Loopback(raws)) => raws,
            Ok(Forwarded::Queued) => Vec::new(),
            Err(error) => {
                error!(lab_id = %state.lab_id, error = ?error, "failed to forward ownership change");
                Vec::new()
            }
        }
    }

    async fn retire_lab(&self, entry: &LabEntry, lab_id: Uuid) {
        let closed = entry.channel.close_all(CloseReason::LabDeleted).await;
        self.deleted_labs.write().await.insert(lab_id, Utc::now());
        self.labs.write().await.remove(&lab_id);
        self.presence.forget_lab(lab_id).await;
        self.sequencer.forget(lab_id).await;
        info!(lab_id = %lab_id, closed, "lab deleted, sessions closed");
    }

    async fn broadcast_presence(&self, entry: &LabEntry, change: &PresenceChange) {
        let backlog = entry.backlog.read().await;
        let delivered = entry.channel.publish_presence(change, backlog.state()).await;
        debug!(
            lab_id = %change.lab_id,
            user_id = %change.user_id,
            state = change.state.as_str(),
            delivered,
            "presence published"
        );
    }

    /// Loaded entry for `lab_id`, hydrating it from the store on first use.
    /// With `create`, a lab the store does not know starts empty.
    async fn lookup(&self, lab_id: Uuid, create: bool) -> anyhow::Result<Option<Arc<LabEntry>>> {
        if let Some(entry) = self.labs.read().await.get(&lab_id) {
            return Ok(Some(Arc::clone(entry)));
        }
        if self.is_deleted(lab_id).await {
            return Ok(None);
        }

        let head_seq = self.sequencer.head(lab_id).await;
        let state = match self.store.load_lab(lab_id).await? {
            Some(state) => state,
            None if create => LabState::new(lab_id),
            None => return Ok(None),
        };
        let backlog = LabBacklog::hydrated(state, head_seq, self.config.backlog_capacity);

        let mut labs = self.labs.write().await;
        let entry = labs
            .entry(lab_id)
            .or_insert_with(|| Arc::new(LabEntry::new(backlog, self.config.session_buffer)));
        Ok(Some(Arc::clone(entry)))
    }
}

fn is_contiguous(events: &[ChangeEvent], after: i64, upto: i64) -> bool {
    events.len() as i64 == upto - after
        && events.iter().zip(after + 1..).all(|(event, seq)| event.seq == seq)
}
