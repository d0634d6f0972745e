//! Room rows. Rooms are written whole: the sync processor computes the
//! merged record and persists it in one statement.

use rusqlite::{Connection, params};

use harbor_types::{Room, RoomId};

use crate::rows::{ROOM_COLS, map_room, name_quality_int};
use crate::{OptionalExt, Result, Store};

pub fn get_room(conn: &Connection, id: &RoomId) -> Result<Option<Room>> {
    let mut stmt = conn.prepare(&format!("SELECT {ROOM_COLS} FROM rooms WHERE id = ?1"))?;
    stmt.query_row([&id.0], map_room).optional()
}

/// Inserts or fully replaces a room row.
pub fn save_room(conn: &Connection, room: &Room) -> Result<()> {
    let heroes = serde_json::to_string(&room.summary.heroes)?;
    conn.execute(
        "INSERT INTO rooms (id, create_content, tombstone_content, name, name_quality,
             avatar_url, avatar_explicit, dm_user_id, topic, heroes, joined_count,
             invited_count, encryption, has_member_list, preview_event, sorting_timestamp,
             unread_highlights, unread_notifications, unread_messages, marked_unread, prev_batch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21)
         ON CONFLICT(id) DO UPDATE SET
             create_content = excluded.create_content,
             tombstone_content = excluded.tombstone_content,
             name = excluded.name,
             name_quality = excluded.name_quality,
             avatar_url = excluded.avatar_url,
             avatar_explicit = excluded.avatar_explicit,
             dm_user_id = excluded.dm_user_id,
             topic = excluded.topic,
             heroes = excluded.heroes,
             joined_count = excluded.joined_count,
             invited_count = excluded.invited_count,
             encryption = excluded.encryption,
             has_member_list = excluded.has_member_list,
             preview_event = excluded.preview_event,
             sorting_timestamp = excluded.sorting_timestamp,
             unread_highlights = excluded.unread_highlights,
             unread_notifications = excluded.unread_notifications,
             unread_messages = excluded.unread_messages,
             marked_unread = excluded.marked_unread,
             prev_batch = excluded.prev_batch",
        params![
            room.id.0,
            room.create_content.as_ref().map(serde_json::Value::to_string),
            room.tombstone_content.as_ref().map(serde_json::Value::to_string),
            room.name,
            name_quality_int(room.name_quality),
            room.avatar_url,
            room.avatar_explicit as i64,
            room.dm_user_id.as_ref().map(|u| &u.0),
            room.topic,
            heroes,
            room.summary.joined as i64,
            room.summary.invited as i64,
            room.encryption,
            room.has_member_list as i64,
            room.preview_event.map(|r| r.0),
            room.sorting_timestamp,
            room.unread_highlights,
            room.unread_notifications,
            room.unread_messages,
            room.marked_unread as i64,
            room.prev_batch,
        ],
    )?;
    Ok(())
}

/// Updates only the pagination cursor.
pub fn set_prev_batch(conn: &Connection, id: &RoomId, prev_batch: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET prev_batch = ?2 WHERE id = ?1",
        params![id.0, prev_batch],
    )?;
    Ok(())
}

pub fn set_marked_unread(conn: &Connection, id: &RoomId, unread: bool) -> Result<()> {
    conn.execute(
        "UPDATE rooms SET marked_unread = ?2 WHERE id = ?1",
        params![id.0, unread as i64],
    )?;
    Ok(())
}

/// Rooms ordered by sorting timestamp, newest first, for snapshot paging.
pub fn list_rooms(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<Room>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROOM_COLS} FROM rooms ORDER BY sorting_timestamp DESC, id LIMIT ?1 OFFSET ?2"
    ))?;
    let rooms = stmt
        .query_map(params![limit, offset], map_room)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rooms)
}

/// Drops a room and everything hanging off it. Only called on leave.
pub fn delete_room(conn: &Connection, id: &RoomId) -> Result<bool> {
    conn.execute("DELETE FROM timeline WHERE room_id = ?1", [&id.0])?;
    conn.execute("DELETE FROM current_state WHERE room_id = ?1", [&id.0])?;
    conn.execute("DELETE FROM receipts WHERE room_id = ?1", [&id.0])?;
    conn.execute("DELETE FROM session_requests WHERE room_id = ?1", [&id.0])?;
    conn.execute(
        "DELETE FROM space_edges WHERE space_id = ?1 OR child_id = ?1",
        [&id.0],
    )?;
    conn.execute(
        "DELETE FROM media_refs WHERE event_rowid IN (SELECT id FROM events WHERE room_id = ?1)",
        [&id.0],
    )?;
    conn.execute("DELETE FROM events WHERE room_id = ?1", [&id.0])?;
    let affected = conn.execute("DELETE FROM rooms WHERE id = ?1", [&id.0])?;
    Ok(affected > 0)
}

impl Store {
    pub fn get_room(&self, id: &RoomId) -> Result<Option<Room>> {
        self.with_conn(|conn| get_room(conn, id))
    }

    pub fn list_rooms(&self, limit: u32, offset: u32) -> Result<Vec<Room>> {
        self.with_conn(|conn| list_rooms(conn, limit, offset))
    }
}
