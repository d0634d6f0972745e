//! End-to-end sync processor scenarios against an in-memory store.

use std::sync::Arc;

use tokio::sync::Notify;

use harbor_crypto::{CryptoProvider, LocalCrypto, NullMediaSink};
use harbor_store::Store;
use harbor_sync::paginate::PaginationRegistry;
use harbor_sync::{ProcessOutcome, Processor};
use harbor_types::{
    Account, EphemeralSignal, EventId, NameQuality, PduEvent, ReceiptEntry, ReceiptKind, RoomId,
    RoomUpdate, SummaryDelta, SyncPayload, UserId, kinds,
};

fn own_user() -> UserId {
    UserId::from("@me:x")
}

fn room_id() -> RoomId {
    RoomId::from("!room:x")
}

fn setup() -> (Arc<Store>, Processor) {
    let store = Arc::new(Store::in_memory().unwrap());
    store
        .put_account(&Account {
            user_id: own_user(),
            device_id: "DEV".into(),
            access_token: "tok".into(),
            next_batch: None,
        })
        .unwrap();
    let processor = Processor::new(
        store.clone(),
        Arc::new(LocalCrypto::new()),
        Arc::new(NullMediaSink),
        Arc::new(Notify::new()),
        Arc::new(PaginationRegistry::new()),
    );
    (store, processor)
}

fn message(id: &str, sender: &str, ts: i64, body: &str) -> PduEvent {
    PduEvent {
        event_id: EventId::from(id),
        sender: UserId::from(sender),
        kind: kinds::MESSAGE.into(),
        state_key: None,
        origin_ts: ts,
        content: serde_json::json!({"body": body}),
        txn_id: None,
    }
}

fn payload(next_batch: &str, rooms: Vec<RoomUpdate>) -> SyncPayload {
    SyncPayload {
        next_batch: next_batch.into(),
        rooms,
        left_rooms: Vec::new(),
        account_data: Vec::new(),
        to_device: Vec::new(),
    }
}

#[test]
fn new_room_with_one_message() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![message("$m1", "@bob:x", 1000, "hello")];
    update.prev_batch = Some("gap-1".into());
    let outcome = processor.process(&payload("batch-1", vec![update])).unwrap();

    assert_eq!(outcome.changes.rooms.len(), 1);
    let room = store.get_room(&room_id()).unwrap().unwrap();
    // no state, no heroes: the name falls back to the room id
    assert_eq!(room.name.as_deref(), Some("!room:x"));
    assert_eq!(room.name_quality, NameQuality::Nil);
    assert_eq!(room.unread_messages, 1);
    assert_eq!(room.unread_notifications, 1);
    assert_eq!(room.sorting_timestamp, 1000);
    assert_eq!(room.prev_batch.as_deref(), Some("gap-1"));

    // the cursor advanced last, after room data
    let account = store.account().unwrap().unwrap();
    assert_eq!(account.next_batch.as_deref(), Some("batch-1"));
}

#[test]
fn replaying_a_batch_is_idempotent() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.state = vec![PduEvent {
        event_id: EventId::from("$name"),
        sender: UserId::from("@bob:x"),
        kind: kinds::NAME.into(),
        state_key: Some(String::new()),
        origin_ts: 500,
        content: serde_json::json!({"name": "Ops"}),
        txn_id: None,
    }];
    update.timeline = vec![
        message("$m1", "@bob:x", 1000, "one"),
        message("$m2", "@bob:x", 1001, "two"),
    ];
    let batch = payload("batch-1", vec![update]);

    processor.process(&batch).unwrap();
    let first = store.get_room(&room_id()).unwrap().unwrap();

    processor.process(&batch).unwrap();
    let second = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(first, second);

    // no duplicate timeline rows, no duplicate state pointers
    let page = store.timeline_page(&room_id(), None, 10).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(store.room_state(&room_id()).unwrap().len(), 1);
    assert_eq!(second.unread_messages, 2);
}

#[test]
fn explicit_name_beats_heroes_and_id_fallback() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.summary = Some(SummaryDelta {
        heroes: Some(vec![UserId::from("@bob:x")]),
        joined: Some(2),
        invited: Some(0),
    });
    update.state = vec![PduEvent {
        event_id: EventId::from("$name"),
        sender: UserId::from("@bob:x"),
        kind: kinds::NAME.into(),
        state_key: Some(String::new()),
        origin_ts: 500,
        content: serde_json::json!({"name": "War Room"}),
        txn_id: None,
    }];
    processor.process(&payload("b1", vec![update])).unwrap();

    let room = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(room.name.as_deref(), Some("War Room"));
    assert_eq!(room.name_quality, NameQuality::Explicit);
    // the heroes summary still landed
    assert_eq!(room.summary.joined, 2);
}

#[test]
fn heroes_name_dm_detection() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.summary = Some(SummaryDelta {
        heroes: Some(vec![UserId::from("@carol:x")]),
        joined: Some(2),
        invited: Some(0),
    });
    processor.process(&payload("b1", vec![update])).unwrap();

    let room = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(room.name.as_deref(), Some("carol"));
    assert_eq!(room.name_quality, NameQuality::Heroes);
    assert_eq!(room.dm_user_id, Some(UserId::from("@carol:x")));
}

#[test]
fn limited_sync_clears_timeline_and_updates_cursor() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![message("$m1", "@bob:x", 1000, "one")];
    update.prev_batch = Some("gap-1".into());
    processor.process(&payload("b1", vec![update])).unwrap();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![message("$m9", "@bob:x", 9000, "much later")];
    update.limited = true;
    update.prev_batch = Some("gap-9".into());
    let outcome = processor.process(&payload("b2", vec![update])).unwrap();

    assert!(outcome.changes.rooms[0].reset_timeline);
    let room = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(room.prev_batch.as_deref(), Some("gap-9"));
    // only the post-gap event survives in the cache
    let page = store.timeline_page(&room_id(), None, 10).unwrap();
    assert!(page.is_empty());
}

#[test]
fn own_receipt_moving_backward_triggers_full_recount() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![
        message("$m1", "@bob:x", 1000, "one"),
        message("$m2", "@bob:x", 1001, "two"),
        message("$m3", "@bob:x", 1002, "three"),
    ];
    processor.process(&payload("b1", vec![update])).unwrap();
    assert_eq!(
        store.get_room(&room_id()).unwrap().unwrap().unread_messages,
        3
    );

    let mut update = RoomUpdate::new(room_id());
    update.ephemeral = vec![EphemeralSignal::Receipts {
        receipts: vec![ReceiptEntry {
            user_id: own_user(),
            kind: ReceiptKind::Read,
            thread: None,
            event_id: EventId::from("$m1"),
            ts: 2000,
        }],
    }];
    processor.process(&payload("b2", vec![update])).unwrap();

    let room = store.get_room(&room_id()).unwrap().unwrap();
    // the receipt lands before already-unread events: counts match a full
    // recount strictly after the boundary
    assert_eq!(room.unread_messages, 2);
    assert_eq!(room.unread_notifications, 2);
    assert!(!room.marked_unread);
}

#[test]
fn own_message_resets_unread() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![
        message("$m1", "@bob:x", 1000, "ping"),
        message("$m2", "@me:x", 1001, "pong"),
    ];
    processor.process(&payload("b1", vec![update])).unwrap();

    let room = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(room.unread_messages, 0);
    assert_eq!(room.unread_notifications, 0);
}

#[test]
fn redaction_updates_target_and_recounts() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![
        message("$m1", "@bob:x", 1000, "oops"),
        message("$m2", "@bob:x", 1001, "keep"),
    ];
    processor.process(&payload("b1", vec![update])).unwrap();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![PduEvent {
        event_id: EventId::from("$redact"),
        sender: UserId::from("@bob:x"),
        kind: kinds::REDACTION.into(),
        state_key: None,
        origin_ts: 1002,
        content: serde_json::json!({"redacts": "$m1"}),
        txn_id: None,
    }];
    let outcome = processor.process(&payload("b2", vec![update])).unwrap();

    let redacted = store.get_event(&EventId::from("$m1")).unwrap().unwrap();
    assert_eq!(redacted.redacted_by, Some(EventId::from("$redact")));

    // the change-set carries the updated target view
    let change = &outcome.changes.rooms[0];
    assert!(change.events.iter().any(|e| e.id == EventId::from("$m1")));

    // the redacted event no longer contributes to unread
    let room = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(room.unread_messages, 1);
}

#[test]
fn edit_and_reaction_resolve_their_targets() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![message("$m1", "@bob:x", 1000, "helo")];
    processor.process(&payload("b1", vec![update])).unwrap();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![
        PduEvent {
            event_id: EventId::from("$edit"),
            sender: UserId::from("@bob:x"),
            kind: kinds::MESSAGE.into(),
            state_key: None,
            origin_ts: 1001,
            content: serde_json::json!({
                "body": "* hello",
                "relates_to": {"event_id": "$m1", "rel_type": "replace"},
            }),
            txn_id: None,
        },
        PduEvent {
            event_id: EventId::from("$react"),
            sender: UserId::from("@carol:x"),
            kind: "room.reaction".into(),
            state_key: None,
            origin_ts: 1002,
            content: serde_json::json!({
                "relates_to": {"event_id": "$m1", "rel_type": "annotation", "key": "+1"},
            }),
            txn_id: None,
        },
    ];
    let outcome = processor.process(&payload("b2", vec![update])).unwrap();

    let target = store.get_event(&EventId::from("$m1")).unwrap().unwrap();
    let edit = store.get_event(&EventId::from("$edit")).unwrap().unwrap();
    assert_eq!(target.last_edit, Some(edit.rowid));
    assert_eq!(target.reactions.get("+1"), Some(&1));

    // target appears once in the change-set despite two relations to it
    let change = &outcome.changes.rooms[0];
    let hits = change
        .events
        .iter()
        .filter(|e| e.id == EventId::from("$m1"))
        .count();
    assert_eq!(hits, 1);
}

#[test]
fn encrypted_event_queues_session_request() {
    let (store, processor) = setup();

    let other = LocalCrypto::new();
    let ciphertext = other
        .encrypt(&room_id(), kinds::MESSAGE, &serde_json::json!({"body": "x"}))
        .unwrap();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![PduEvent {
        event_id: EventId::from("$enc"),
        sender: UserId::from("@bob:x"),
        kind: kinds::ENCRYPTED.into(),
        state_key: None,
        origin_ts: 1000,
        content: ciphertext,
        txn_id: None,
    }];
    let outcome = processor.process(&payload("b1", vec![update])).unwrap();

    assert!(outcome.queued_decryption);
    let pending = store.pending_session_requests(5).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sender, UserId::from("@bob:x"));

    let event = store.get_event(&EventId::from("$enc")).unwrap().unwrap();
    assert!(event.decryption_error.is_some());
    // an undecryptable message still counts as unread
    let room = store.get_room(&room_id()).unwrap().unwrap();
    assert_eq!(room.unread_messages, 1);
}

#[test]
fn failing_batch_rolls_back_entirely() {
    let (store, processor) = setup();

    // a payload the store cannot apply: the account row disappears first
    store
        .with_conn(|conn| {
            conn.execute("DELETE FROM account", [])?;
            Ok(())
        })
        .unwrap();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![message("$m1", "@bob:x", 1000, "hi")];
    let result = processor.process(&payload("b1", vec![update]));
    assert!(result.is_err());

    // nothing from the batch was applied
    assert!(store.get_room(&room_id()).unwrap().is_none());
    assert!(store.get_event(&EventId::from("$m1")).unwrap().is_none());
}

#[test]
fn left_room_is_dropped() {
    let (store, processor) = setup();

    let mut update = RoomUpdate::new(room_id());
    update.timeline = vec![message("$m1", "@bob:x", 1000, "hi")];
    processor.process(&payload("b1", vec![update])).unwrap();
    assert!(store.get_room(&room_id()).unwrap().is_some());

    let mut leave = payload("b2", Vec::new());
    leave.left_rooms = vec![room_id()];
    let outcome = processor.process(&leave).unwrap();

    assert_eq!(outcome.changes.left_rooms, vec![room_id()]);
    assert!(store.get_room(&room_id()).unwrap().is_none());
}

#[test]
fn pushed_session_lands_in_outcome() {
    let (_store, processor) = setup();

    let mut batch = payload("b1", Vec::new());
    batch.to_device = vec![harbor_types::ToDeviceEvent {
        sender: UserId::from("@me:x"),
        kind: "encryption.session_share".into(),
        content: serde_json::json!({
            "room_id": "!room:x",
            "session_id": "abc",
            "key": "AAAA",
            "first_index": 0,
        }),
    }];
    let outcome: ProcessOutcome = processor.process(&batch).unwrap();
    assert_eq!(outcome.sessions.len(), 1);
    assert_eq!(outcome.sessions[0].session_id.0, "abc");
}
