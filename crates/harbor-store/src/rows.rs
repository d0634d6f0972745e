//! Row-to-model mapping shared by the query modules.

use rusqlite::Row;
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

use harbor_types::{
    Event, EventId, EventRowId, NameQuality, RelationKind, Room, RoomId, RoomSummary, UnreadFlags,
    UserId,
};

/// Column list every event SELECT uses, in `map_event` order.
pub const EVENT_COLS: &str = "e.id, e.event_id, e.txn_id, e.room_id, e.sender, e.type, \
     e.state_key, e.origin_ts, e.content, e.decrypted, e.decrypted_type, e.decryption_error, \
     e.redacted_by, e.relates_to, e.relation_kind, e.reactions, e.last_edit, \
     e.unread_highlight, e.unread_notify, e.unread_sound, e.unread_message";

/// Column list every room SELECT uses, in `map_room` order.
pub const ROOM_COLS: &str = "id, create_content, tombstone_content, name, name_quality, \
     avatar_url, avatar_explicit, dm_user_id, topic, heroes, joined_count, invited_count, \
     encryption, has_member_list, preview_event, sorting_timestamp, unread_highlights, \
     unread_notifications, unread_messages, marked_unread, prev_batch";

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

fn relation_kind(raw: Option<String>) -> Option<RelationKind> {
    match raw.as_deref() {
        Some("replace") => Some(RelationKind::Replace),
        Some("annotation") => Some(RelationKind::Annotation),
        Some("reply") => Some(RelationKind::Reply),
        _ => None,
    }
}

pub fn relation_kind_str(kind: RelationKind) -> &'static str {
    match kind {
        RelationKind::Replace => "replace",
        RelationKind::Annotation => "annotation",
        RelationKind::Reply => "reply",
    }
}

pub fn name_quality(raw: i64) -> NameQuality {
    match raw {
        3 => NameQuality::Explicit,
        2 => NameQuality::CanonicalAlias,
        1 => NameQuality::Heroes,
        _ => NameQuality::Nil,
    }
}

pub fn name_quality_int(q: NameQuality) -> i64 {
    match q {
        NameQuality::Explicit => 3,
        NameQuality::CanonicalAlias => 2,
        NameQuality::Heroes => 1,
        NameQuality::Nil => 0,
    }
}

pub fn map_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    map_event_at(row, 0)
}

/// Maps an event whose `EVENT_COLS` start at column `base` (for SELECTs
/// that prefix extra columns, e.g. the timeline seq).
pub fn map_event_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Event> {
    let content: Option<Value> = json_col(row, base + 8)?;
    let reactions: Option<BTreeMap<String, i64>> = json_col(row, base + 15)?;
    Ok(Event {
        rowid: EventRowId(row.get(base)?),
        id: EventId(row.get(base + 1)?),
        txn_id: row.get(base + 2)?,
        room_id: RoomId(row.get(base + 3)?),
        sender: UserId(row.get(base + 4)?),
        kind: row.get(base + 5)?,
        state_key: row.get(base + 6)?,
        origin_ts: row.get(base + 7)?,
        content: content.unwrap_or(Value::Null),
        decrypted: json_col(row, base + 9)?,
        decrypted_kind: row.get(base + 10)?,
        decryption_error: row.get(base + 11)?,
        redacted_by: row.get::<_, Option<String>>(base + 12)?.map(EventId),
        relates_to: row.get::<_, Option<String>>(base + 13)?.map(EventId),
        relation_kind: relation_kind(row.get(base + 14)?),
        reactions: reactions.unwrap_or_default(),
        last_edit: row.get::<_, Option<i64>>(base + 16)?.map(EventRowId),
        unread: UnreadFlags {
            highlight: row.get::<_, i64>(base + 17)? != 0,
            notify: row.get::<_, i64>(base + 18)? != 0,
            sound: row.get::<_, i64>(base + 19)? != 0,
            message: row.get::<_, i64>(base + 20)? != 0,
        },
    })
}

pub fn map_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    let heroes: Option<Vec<UserId>> = json_col(row, 9)?;
    Ok(Room {
        id: RoomId(row.get(0)?),
        create_content: json_col(row, 1)?,
        tombstone_content: json_col(row, 2)?,
        name: row.get(3)?,
        name_quality: name_quality(row.get(4)?),
        avatar_url: row.get(5)?,
        avatar_explicit: row.get::<_, i64>(6)? != 0,
        dm_user_id: row.get::<_, Option<String>>(7)?.map(UserId),
        topic: row.get(8)?,
        summary: RoomSummary {
            heroes: heroes.unwrap_or_default(),
            joined: row.get::<_, i64>(10)?.max(0) as u64,
            invited: row.get::<_, i64>(11)?.max(0) as u64,
        },
        encryption: row.get(12)?,
        has_member_list: row.get::<_, i64>(13)? != 0,
        preview_event: row.get::<_, Option<i64>>(14)?.map(EventRowId),
        sorting_timestamp: row.get(15)?,
        unread_highlights: row.get(16)?,
        unread_notifications: row.get(17)?,
        unread_messages: row.get(18)?,
        marked_unread: row.get::<_, i64>(19)? != 0,
        prev_batch: row.get(20)?,
    })
}
