//! The gateway wire format: JSON frames `{command, request_id, data}` in
//! both directions. Caller-chosen positive request ids on requests are
//! echoed on `response`/`error`; server-push events carry negative or zero
//! synthetic ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, RoomId, UserId};
use crate::models::{Event, Receipt, Room, SyncStatus};
use crate::sync::AccountDataEvent;

/// An inbound client frame. The command name selects the typed payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub request_id: i64,
    #[serde(flatten)]
    pub command: Command,
}

/// Commands a front end can issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Load older timeline events, local-first. `before` is the oldest
    /// timeline sequence number the client already has.
    Paginate {
        room_id: RoomId,
        before: Option<i64>,
        limit: u32,
    },
    /// Cooperatively abort a named in-flight request.
    Cancel {
        request_id: i64,
    },
    SendMessage {
        room_id: RoomId,
        #[serde(rename = "type")]
        kind: String,
        content: Value,
    },
    MarkRead {
        room_id: RoomId,
        event_id: EventId,
    },
    SetMarkedUnread {
        room_id: RoomId,
        unread: bool,
    },
    GetRoomState {
        room_id: RoomId,
    },
    GetEvent {
        room_id: RoomId,
        event_id: EventId,
    },
    GetReceipts {
        room_id: RoomId,
        event_id: EventId,
    },
    GetSpaceHierarchy {
        space_id: RoomId,
    },
}

/// An outbound frame: a response, an error, or a pushed event.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub command: String,
    pub request_id: i64,
    pub data: Value,
}

impl OutboundFrame {
    pub fn response(request_id: i64, data: Value) -> Self {
        Self {
            command: "response".into(),
            request_id,
            data,
        }
    }

    pub fn error(request_id: i64, message: impl Into<String>) -> Self {
        Self {
            command: "error".into(),
            request_id,
            data: serde_json::json!({ "message": message.into() }),
        }
    }

    /// Wraps a push event into the envelope under its synthetic request id.
    pub fn push(request_id: i64, event: &PushEvent) -> serde_json::Result<Self> {
        let mut value = serde_json::to_value(event)?;
        let command = value
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Ok(Self {
            command,
            request_id,
            data,
        })
    }
}

/// Server-push events. Serialized into the `{command, data}` half of an
/// outbound frame; the gateway fills in the synthetic request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// First frame after connect: identifies this server run and the wire
    /// content version, so clients know whether their cursor is resumable.
    RunId {
        run_id: String,
        content_version: u32,
    },
    ClientState {
        user_id: UserId,
        device_id: String,
    },
    SyncStatus {
        status: SyncStatus,
    },
    /// One applied sync batch's change-set.
    SyncComplete {
        changes: ChangeSet,
    },
    /// Previously-failed events that a newly arrived session decrypted.
    EventsDecrypted {
        room_id: RoomId,
        events: Vec<Event>,
        preview_changed: bool,
    },
    Typing {
        room_id: RoomId,
        user_ids: Vec<UserId>,
    },
    /// Older history paginated into a room's timeline.
    HistoryLoaded {
        room_id: RoomId,
        events: Vec<Event>,
        has_more: bool,
    },
    /// A page of the initial snapshot, rooms ordered newest-first.
    InitialRooms {
        rooms: Vec<Room>,
    },
    InitComplete,
    /// Short-lived token front ends attach to media requests.
    ImageToken {
        token: String,
        expires_in_ms: u64,
    },
}

impl PushEvent {
    /// Whether the resumable buffer may retain this event for replay.
    /// Ephemeral and snapshot frames are delivered live only; the current
    /// sync status is re-sent on every connect, so a stale copy must never
    /// be replayed over it.
    pub fn cacheable(&self) -> bool {
        !matches!(
            self,
            Self::RunId { .. }
                | Self::ClientState { .. }
                | Self::SyncStatus { .. }
                | Self::Typing { .. }
                | Self::InitialRooms { .. }
                | Self::InitComplete
                | Self::ImageToken { .. }
        )
    }
}

/// The change-set one sync batch produced, grouped by room.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChangeSet {
    #[serde(default)]
    pub rooms: Vec<RoomChange>,
    #[serde(default)]
    pub account_data: Vec<AccountDataEvent>,
    /// Rooms dropped because the local user left.
    #[serde(default)]
    pub left_rooms: Vec<RoomId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty() && self.account_data.is_empty() && self.left_rooms.is_empty()
    }

    /// The change entry for `room_id`, created on first use.
    pub fn room(&mut self, room_id: &RoomId) -> &mut RoomChange {
        if let Some(idx) = self.rooms.iter().position(|c| &c.room.id == room_id) {
            return &mut self.rooms[idx];
        }
        self.rooms.push(RoomChange::new(crate::models::Room::empty(room_id.clone())));
        self.rooms.last_mut().unwrap()
    }
}

/// Everything that changed in one room during a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomChange {
    pub room: Room,
    /// New or updated event rows, deduplicated by row id.
    pub events: Vec<Event>,
    pub receipts: Vec<Receipt>,
    /// True when a gappy sync cleared the local timeline for this room.
    pub reset_timeline: bool,
}

impl RoomChange {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            events: Vec::new(),
            receipts: Vec::new(),
            reset_timeline: false,
        }
    }

    /// Adds an event unless a row with the same row id is already present;
    /// an update replaces the stale copy.
    pub fn push_event(&mut self, event: Event) {
        if let Some(existing) = self.events.iter_mut().find(|e| e.rowid == event.rowid) {
            *existing = event;
        } else {
            self.events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EventRowId;
    use crate::models::{NameQuality, UnreadFlags};
    use std::collections::BTreeMap;

    fn event(rowid: i64) -> Event {
        Event {
            rowid: EventRowId(rowid),
            id: EventId::from("$e"),
            txn_id: None,
            room_id: RoomId::from("!r"),
            sender: UserId::from("@u"),
            kind: "room.message".into(),
            state_key: None,
            origin_ts: 0,
            content: serde_json::json!({}),
            decrypted: None,
            decrypted_kind: None,
            decryption_error: None,
            redacted_by: None,
            relates_to: None,
            relation_kind: None,
            reactions: BTreeMap::new(),
            last_edit: None,
            unread: UnreadFlags::default(),
        }
    }

    #[test]
    fn inbound_frame_parses_envelope() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"command":"paginate","request_id":7,"data":{"room_id":"!a:x","limit":20}}"#,
        )
        .unwrap();
        assert_eq!(frame.request_id, 7);
        match frame.command {
            Command::Paginate {
                room_id,
                before,
                limit,
            } => {
                assert_eq!(room_id, RoomId::from("!a:x"));
                assert_eq!(before, None);
                assert_eq!(limit, 20);
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn push_event_envelope_shape() {
        let ev = PushEvent::Typing {
            room_id: RoomId::from("!a:x"),
            user_ids: vec![UserId::from("@u:x")],
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["command"], "typing");
        assert_eq!(v["data"]["room_id"], "!a:x");

        let frame = OutboundFrame::push(-9, &ev).unwrap();
        assert_eq!(frame.command, "typing");
        assert_eq!(frame.request_id, -9);
        assert_eq!(frame.data["room_id"], "!a:x");

        // a data-less event yields a null payload, not a missing field
        let frame = OutboundFrame::push(0, &PushEvent::InitComplete).unwrap();
        assert_eq!(frame.command, "init_complete");
        assert_eq!(frame.data, serde_json::Value::Null);
    }

    #[test]
    fn cacheable_excludes_ephemeral_and_snapshot() {
        let typing = PushEvent::Typing {
            room_id: RoomId::from("!a"),
            user_ids: Vec::new(),
        };
        assert!(!typing.cacheable());

        let sync = PushEvent::SyncComplete {
            changes: ChangeSet::default(),
        };
        assert!(sync.cacheable());
    }

    #[test]
    fn room_change_dedupes_by_rowid() {
        let mut change = RoomChange::new(Room::empty(RoomId::from("!r")));
        change.push_event(event(1));
        let mut updated = event(1);
        updated.unread = UnreadFlags {
            highlight: true,
            notify: true,
            sound: false,
            message: true,
        };
        change.push_event(updated.clone());
        change.push_event(event(2));

        assert_eq!(change.events.len(), 2);
        assert_eq!(change.events[0], updated);
        assert_eq!(change.room.name_quality, NameQuality::Nil);
    }
}
