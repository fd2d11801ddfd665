use std::time::Duration;

use chrono::{TimeZone, Utc};
use labsync_common::error::{RejectReason, SyncError};
use labsync_common::sync::{LabReplica, ReconcileReply};
use labsync_common::types::{
    ChangeEvent, ChatMessage, EntityPayload, Lab, LocalEdit, Membership, Operation, Role, Todo,
    UserProfile,
};
use labsync_relay::capture::{raw_from_payload, RawMutation};
use labsync_relay::channel::{CloseReason, SessionEvent, SessionHandle};
use labsync_relay::hub::{EditOutcome, HubConfig, HubError, LabHub};
use uuid::Uuid;

const LAB: Uuid = Uuid::from_u128(0x1AB);
const OWNER: Uuid = Uuid::from_u128(0x0A);
const MEMBER_A: Uuid = Uuid::from_u128(0x0B);
const ADMIN_B: Uuid = Uuid::from_u128(0x0C);
const TODO: Uuid = Uuid::from_u128(0x7001);

fn at(seconds: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn raw(op: Operation, payload: EntityPayload, commit: impl Into<String>) -> RawMutation {
    raw_from_payload(op, &payload, commit.into(), at(0)).expect("row should encode")
}

fn lab_row(archived: bool) -> EntityPayload {
    EntityPayload::Lab(Lab { id: LAB, name: "Optics".into(), owner_id: OWNER, archived })
}

fn member(user_id: Uuid, role: Role, clock: u64, joined: i64) -> EntityPayload {
    EntityPayload::Membership(Membership {
        lab_id: LAB,
        user_id,
        role,
        clock,
        changed_by: OWNER,
        joined_at: at(joined),
    })
}

fn todo(done: bool, clock: u64, by: Uuid) -> EntityPayload {
    EntityPayload::Todo(Todo {
        id: TODO,
        lab_id: LAB,
        text: "align mirrors".into(),
        done,
        clock,
        modified_by: by,
    })
}

fn message(n: u64, author: Uuid) -> EntityPayload {
    EntityPayload::ChatMessage(ChatMessage {
        id: Uuid::from_u128(0xC000 + u128::from(n)),
        lab_id: LAB,
        author_id: author,
        text: format!("reading {n}"),
        created_at: at(n as i64),
        clock: n,
        author_seq: n,
        seq: 0,
    })
}

/// Lab with an owner, member A (joined first) and admin B. Head is 4.
async fn seeded_hub(config: HubConfig) -> LabHub {
    let hub = LabHub::in_memory(config);
    let report = hub
        .ingest(vec![
            raw(Operation::Insert, lab_row(false), "seed-1"),
            raw(Operation::Insert, member(OWNER, Role::Owner, 1, 0), "seed-2"),
            raw(Operation::Insert, member(MEMBER_A, Role::Member, 1, 10), "seed-3"),
            raw(Operation::Insert, member(ADMIN_B, Role::Admin, 1, 20), "seed-4"),
        ])
        .await;
    assert_eq!(report.committed, 4);
    hub
}

/// Ingest `count` changes, alternating todo toggles and chat messages.
async fn churn(hub: &LabHub, from: u64, count: u64) {
    for n in from..from + count {
        let payload = if n % 2 == 0 { todo(n % 4 == 0, 10 + n, OWNER) } else { message(n, OWNER) };
        let op = if n % 2 == 0 { Operation::Update } else { Operation::Insert };
        let report = hub.ingest(vec![raw(op, payload, format!("churn-{n}"))]).await;
        assert_eq!(report.committed, 1);
    }
}

/// Everything currently deliverable on `handle`.
async fn drain(handle: &mut SessionHandle) -> Vec<SessionEvent> {
    let mut items = Vec::new();
    while let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(50), handle.next()).await
    {
        items.push(item);
    }
    items
}

fn events(items: Vec<SessionEvent>) -> Vec<ChangeEvent> {
    items
        .into_iter()
        .filter_map(|item| match item {
            SessionEvent::Event(event) => Some(event),
            _ => None,
        })
        .collect()
}

async fn connect_replica(hub: &LabHub, user_id: Uuid) -> (SessionHandle, LabReplica) {
    let mut handle = hub.subscribe(LAB, user_id).await.expect("member should subscribe");
    let mut replica = LabReplica::new(LAB, user_id);
    let request = replica.resume_request();
    let reply = hub.reconcile(&mut handle, request.last_seq).await.expect("reconcile");
    replica.apply_reconcile(reply).expect("reply should apply");
    (handle, replica)
}

#[tokio::test]
async fn live_events_arrive_in_sequence_without_gaps() {
    let hub = seeded_hub(HubConfig::default()).await;
    let mut handle = hub.subscribe(LAB, MEMBER_A).await.unwrap();

    churn(&hub, 1, 20).await;

    let seqs: Vec<i64> = events(drain(&mut handle).await).iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (5..=24).collect::<Vec<i64>>());
    assert_eq!(handle.last_seq(), 24);
}

#[tokio::test]
async fn reconnect_replays_missed_events_and_converges() {
    let config = HubConfig { backlog_capacity: 11, ..HubConfig::default() };
    let hub = seeded_hub(config).await;

    let (mut steady_handle, mut steady) = connect_replica(&hub, MEMBER_A).await;
    let (mut flaky_handle, mut flaky) = connect_replica(&hub, ADMIN_B).await;
    assert_eq!(steady.last_seq(), Some(4));

    churn(&hub, 1, 6).await;
    for event in events(drain(&mut flaky_handle).await) {
        flaky.receive(event).expect("in-order event should apply");
    }
    assert_eq!(flaky.last_seq(), Some(10));
    hub.unsubscribe(&flaky_handle).await;

    churn(&hub, 7, 4).await;
    for event in events(drain(&mut steady_handle).await) {
        steady.receive(event).expect("in-order event should apply");
    }
    assert_eq!(steady.last_seq(), Some(14));

    let mut reconnected = hub.subscribe(LAB, ADMIN_B).await.unwrap();
    let request = flaky.resume_request();
    assert_eq!(request.last_seq, Some(10));
    let reply = hub.reconcile(&mut reconnected, request.last_seq).await.unwrap();
    match &reply {
        ReconcileReply::Backlog { events, head_seq } => {
            assert_eq!(*head_seq, 14);
            let seqs: Vec<i64> = events.iter().map(|event| event.seq).collect();
            assert_eq!(seqs, vec![11, 12, 13, 14]);
        }
        other => panic!("expected a backlog reply, got {other:?}"),
    }
    flaky.apply_reconcile(reply).unwrap();

    assert_eq!(flaky.last_seq(), Some(14));
    assert_eq!(flaky.committed(), steady.committed());
}

#[tokio::test]
async fn compacted_range_falls_back_to_snapshot() {
    let config = HubConfig { backlog_capacity: 4, ..HubConfig::default() };
    let hub = seeded_hub(config).await;
    churn(&hub, 1, 8).await;

    let mut handle = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    match hub.reconcile(&mut handle, Some(2)).await.unwrap() {
        ReconcileReply::Snapshot { state, seq } => {
            assert_eq!(seq, 12);
            assert!(state.membership(&MEMBER_A).is_some());
        }
        other => panic!("expected a snapshot, got {other:?}"),
    }
    assert_eq!(handle.last_seq(), 12);
}

#[tokio::test]
async fn concurrent_todo_toggles_resolve_to_the_higher_clock() {
    let hub = seeded_hub(HubConfig::default()).await;
    hub.ingest(vec![raw(Operation::Insert, todo(false, 2, OWNER), "todo-0")]).await;

    // B's toggle (clock 6) is captured before A's (clock 5).
    hub.ingest(vec![raw(Operation::Update, todo(true, 6, ADMIN_B), "todo-b")]).await;
    hub.ingest(vec![raw(Operation::Update, todo(false, 5, MEMBER_A), "todo-a")]).await;

    let (_handle, replica) = connect_replica(&hub, MEMBER_A).await;
    let resolved = replica.committed().todo(&TODO).expect("todo should exist");
    assert!(resolved.done);
    assert_eq!(resolved.modified_by, ADMIN_B);
}

#[tokio::test]
async fn demotion_applies_to_the_next_event_and_edit() {
    let hub = seeded_hub(HubConfig::default()).await;
    let mut handle = hub.subscribe(LAB, ADMIN_B).await.unwrap();

    let rename = LocalEdit::RenameLab { name: "Optics II".into() };
    let outcome = hub.publish_local_edit(&handle, Uuid::new_v4(), rename.clone()).await.unwrap();
    assert_eq!(outcome, EditOutcome::Ack);

    hub.ingest(vec![raw(Operation::Update, member(ADMIN_B, Role::Member, 2, 20), "demote")]).await;
    let outcome = hub.publish_local_edit(&handle, Uuid::new_v4(), rename).await.unwrap();
    assert_eq!(
        outcome,
        EditOutcome::Rejected(RejectReason::InsufficientRole { required: Role::Admin })
    );

    hub.ingest(vec![raw(Operation::Insert, todo(false, 3, OWNER), "after-demote")]).await;
    let delivered = events(drain(&mut handle).await);
    assert!(delivered.iter().any(|event| event.entity_id == TODO));
    assert!(handle.close_reason().is_none());
}

#[tokio::test]
async fn removed_member_stream_closes() {
    let hub = seeded_hub(HubConfig::default()).await;
    let mut removed = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    let mut watcher = hub.subscribe(LAB, ADMIN_B).await.unwrap();
    drain(&mut removed).await;
    drain(&mut watcher).await;

    hub.ingest(vec![raw(Operation::Delete, member(MEMBER_A, Role::Member, 5, 10), "remove-a")])
        .await;
    hub.ingest(vec![raw(Operation::Insert, todo(false, 6, OWNER), "after-remove")]).await;

    let seen = drain(&mut removed).await;
    assert!(seen.is_empty(), "removed member must not see later events: {seen:?}");
    assert_eq!(removed.close_reason(), Some(CloseReason::MembershipRevoked));

    let watched = events(drain(&mut watcher).await);
    let seqs: Vec<i64> = watched.iter().map(|event| event.seq).collect();
    assert_eq!(seqs, vec![5, 6]);

    let error = hub.get_presence(LAB, MEMBER_A).await.expect_err("removed member is refused");
    assert!(matches!(error, HubError::Sync(SyncError::Unauthorized { .. })));
}

#[tokio::test]
async fn slow_subscriber_is_told_to_resync() {
    let config = HubConfig { session_buffer: 2, ..HubConfig::default() };
    let hub = seeded_hub(config).await;
    let mut handle = hub.subscribe(LAB, MEMBER_A).await.unwrap();

    churn(&hub, 1, 6).await;

    let mut last_event = 4;
    let after_seq = loop {
        match tokio::time::timeout(Duration::from_secs(1), handle.next()).await {
            Ok(Some(SessionEvent::Event(event))) => last_event = event.seq,
            Ok(Some(SessionEvent::Presence(_))) => {}
            Ok(Some(SessionEvent::ResyncRequired { after_seq })) => break after_seq,
            other => panic!("expected a resync signal, got {other:?}"),
        }
    };
    assert_eq!(after_seq, last_event);
    assert!(handle.is_degraded());

    match hub.reconcile(&mut handle, Some(after_seq)).await.unwrap() {
        ReconcileReply::Backlog { events, head_seq } => {
            assert_eq!(head_seq, 10);
            assert_eq!(events.first().map(|event| event.seq), Some(after_seq + 1));
        }
        other => panic!("expected a backlog, got {other:?}"),
    }
    assert!(!handle.is_degraded());

    churn(&hub, 7, 1).await;
    let live = events(drain(&mut handle).await);
    assert_eq!(live.iter().map(|event| event.seq).collect::<Vec<_>>(), vec![11]);
}

#[tokio::test]
async fn local_edits_are_acked_broadcast_and_deduplicated() {
    let hub = seeded_hub(HubConfig::default()).await;
    let author = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    let mut peer = hub.subscribe(LAB, ADMIN_B).await.unwrap();
    drain(&mut peer).await;

    let edit_id = Uuid::new_v4();
    let edit = LocalEdit::PostMessage {
        message_id: Uuid::from_u128(0xCAFE),
        text: "beam aligned".into(),
        clock: 2,
        author_seq: 1,
    };
    assert_eq!(hub.publish_local_edit(&author, edit_id, edit.clone()).await.unwrap(), EditOutcome::Ack);
    assert_eq!(hub.publish_local_edit(&author, edit_id, edit).await.unwrap(), EditOutcome::Ack);

    let received = events(drain(&mut peer).await);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].seq, 5);
    assert_eq!(received[0].entity_id, Uuid::from_u128(0xCAFE));
    assert_eq!(hub.sequencer().head(LAB).await, 5);
}

#[tokio::test]
async fn members_cannot_delete_todos() {
    let hub = seeded_hub(HubConfig::default()).await;
    hub.ingest(vec![raw(Operation::Insert, todo(false, 2, OWNER), "todo-0")]).await;
    let handle = hub.subscribe(LAB, MEMBER_A).await.unwrap();

    let outcome = hub
        .publish_local_edit(&handle, Uuid::new_v4(), LocalEdit::DeleteTodo { todo_id: TODO, clock: 3 })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        EditOutcome::Rejected(RejectReason::InsufficientRole { required: Role::Admin })
    );
}

#[tokio::test]
async fn profile_changes_are_redacted_for_other_members() {
    let hub = seeded_hub(HubConfig::default()).await;
    let mut own = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    let mut other = hub.subscribe(LAB, ADMIN_B).await.unwrap();

    let profile = EntityPayload::Profile(UserProfile {
        user_id: MEMBER_A,
        display_name: "Ada".into(),
        email: Some("ada@example.org".into()),
    });
    hub.ingest(vec![raw(Operation::Insert, profile, "profile-a")]).await;

    let email_seen_by = |items: Vec<ChangeEvent>| {
        items.into_iter().find_map(|event| match event.payload {
            EntityPayload::Profile(profile) => Some(profile.email),
            _ => None,
        })
    };
    assert_eq!(email_seen_by(events(drain(&mut own).await)), Some(Some("ada@example.org".to_owned())));
    assert_eq!(email_seen_by(events(drain(&mut other).await)), Some(None));
}

#[tokio::test]
async fn departing_owner_hands_the_lab_to_the_senior_admin() {
    let hub = seeded_hub(HubConfig::default()).await;

    hub.ingest(vec![raw(Operation::Delete, member(OWNER, Role::Owner, 5, 0), "owner-leaves")])
        .await;

    let heir = hub.membership(LAB, ADMIN_B).await.unwrap().expect("admin stays a member");
    assert_eq!(heir.role, Role::Owner);
    assert_eq!(hub.membership(LAB, MEMBER_A).await.unwrap().map(|m| m.role), Some(Role::Member));

    let (handle, replica) = connect_replica(&hub, ADMIN_B).await;
    assert_eq!(replica.committed().lab.as_ref().map(|lab| lab.owner_id), Some(ADMIN_B));

    let outcome = hub.publish_local_edit(&handle, Uuid::new_v4(), LocalEdit::DeleteLab).await;
    assert_eq!(outcome.unwrap(), EditOutcome::Ack);
}

#[tokio::test]
async fn runaway_edit_clocks_are_refused_and_ownership_still_transfers() {
    let hub = seeded_hub(HubConfig::default()).await;
    hub.ingest(vec![raw(Operation::Insert, todo(false, 2, OWNER), "todo-0")]).await;
    let member_session = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    let owner_session = hub.subscribe(LAB, OWNER).await.unwrap();

    let runaway = LocalEdit::SetTodoDone { todo_id: TODO, done: true, clock: u64::MAX };
    let outcome = hub.publish_local_edit(&member_session, Uuid::new_v4(), runaway).await.unwrap();
    assert!(matches!(outcome, EditOutcome::Rejected(RejectReason::Invalid { .. })));

    let leave = LocalEdit::RemoveMember { user_id: OWNER, clock: 3 };
    let outcome = hub.publish_local_edit(&owner_session, Uuid::new_v4(), leave).await.unwrap();
    assert_eq!(outcome, EditOutcome::Ack);
    assert_eq!(hub.membership(LAB, ADMIN_B).await.unwrap().map(|m| m.role), Some(Role::Owner));
}

#[tokio::test]
async fn last_owner_leaving_archives_the_lab() {
    let hub = LabHub::in_memory(HubConfig::default());
    hub.ingest(vec![
        raw(Operation::Insert, lab_row(false), "solo-1"),
        raw(Operation::Insert, member(OWNER, Role::Owner, 1, 0), "solo-2"),
    ])
    .await;

    hub.ingest(vec![raw(Operation::Delete, member(OWNER, Role::Owner, 5, 0), "solo-leaves")])
        .await;
    hub.ingest(vec![raw(Operation::Insert, member(MEMBER_A, Role::Member, 6, 30), "late-join")])
        .await;

    let handle = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    let edit = LocalEdit::CreateTodo { todo_id: TODO, text: "restart".into(), clock: 7 };
    let outcome = hub.publish_local_edit(&handle, Uuid::new_v4(), edit).await.unwrap();
    assert_eq!(outcome, EditOutcome::Rejected(RejectReason::LabArchived));
}

#[tokio::test]
async fn deleting_a_lab_closes_every_session() {
    let hub = seeded_hub(HubConfig::default()).await;
    let mut member_session = hub.subscribe(LAB, MEMBER_A).await.unwrap();
    let mut owner_session = hub.subscribe(LAB, OWNER).await.unwrap();

    hub.ingest(vec![raw(Operation::Delete, lab_row(false), "delete-lab")]).await;

    for handle in [&mut member_session, &mut owner_session] {
        let delivered = events(drain(handle).await);
        assert_eq!(delivered.last().map(|event| event.op), Some(Operation::Delete));
        assert_eq!(handle.close_reason(), Some(CloseReason::LabDeleted));
    }

    let outcome = hub
        .publish_local_edit(&member_session, Uuid::new_v4(), LocalEdit::DeleteLab)
        .await
        .unwrap();
    assert_eq!(outcome, EditOutcome::Rejected(RejectReason::LabDeleted));
    assert!(hub.subscribe(LAB, OWNER).await.is_err());
    assert!(hub.is_deleted(LAB).await);
}
