//! Current-state pointers: one row per (room, type, state-key) slot,
//! superseded by every newer state event for the same slot.

use rusqlite::{Connection, params};

use harbor_types::{Event, EventRowId, RoomId};

use crate::rows::{EVENT_COLS, map_event};
use crate::{OptionalExt, Result, Store};

/// Points the slot at a new event. Last write wins.
pub fn set_pointer(
    conn: &Connection,
    room_id: &RoomId,
    kind: &str,
    state_key: &str,
    rowid: EventRowId,
) -> Result<()> {
    conn.execute(
        "INSERT INTO current_state (room_id, type, state_key, event_rowid)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(room_id, type, state_key) DO UPDATE SET event_rowid = excluded.event_rowid",
        params![room_id.0, kind, state_key, rowid.0],
    )?;
    Ok(())
}

/// The event currently occupying a state slot.
pub fn get_state(
    conn: &Connection,
    room_id: &RoomId,
    kind: &str,
    state_key: &str,
) -> Result<Option<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLS} FROM current_state cs JOIN events e ON e.id = cs.event_rowid
         WHERE cs.room_id = ?1 AND cs.type = ?2 AND cs.state_key = ?3"
    ))?;
    stmt.query_row(params![room_id.0, kind, state_key], map_event)
        .optional()
}

/// All current state for a room.
pub fn room_state(conn: &Connection, room_id: &RoomId) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLS} FROM current_state cs JOIN events e ON e.id = cs.event_rowid
         WHERE cs.room_id = ?1 ORDER BY cs.type, cs.state_key"
    ))?;
    let events = stmt
        .query_map([&room_id.0], map_event)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// All state events of one type, e.g. every member of a room.
pub fn state_of_kind(conn: &Connection, room_id: &RoomId, kind: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLS} FROM current_state cs JOIN events e ON e.id = cs.event_rowid
         WHERE cs.room_id = ?1 AND cs.type = ?2 ORDER BY cs.state_key"
    ))?;
    let events = stmt
        .query_map(params![room_id.0, kind], map_event)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

impl Store {
    pub fn room_state(&self, room_id: &RoomId) -> Result<Vec<Event>> {
        self.with_conn(|conn| room_state(conn, room_id))
    }

    pub fn get_state(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Result<Option<Event>> {
        self.with_conn(|conn| get_state(conn, room_id, kind, state_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NewEvent, upsert_event};
    use harbor_types::{EventId, UserId};

    fn state_event(conn: &Connection, id: &str, kind: &str, state_key: &str) -> EventRowId {
        let mut ev = NewEvent::plain(
            EventId::from(id),
            RoomId::from("!r:x"),
            UserId::from("@u:x"),
            kind,
            1,
            serde_json::json!({"v": id}),
        );
        ev.state_key = Some(state_key.to_string());
        upsert_event(conn, &ev).unwrap().0
    }

    #[test]
    fn newer_state_supersedes_slot() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let room = RoomId::from("!r:x");
                let first = state_event(conn, "$n1", "room.name", "");
                set_pointer(conn, &room, "room.name", "", first)?;
                let second = state_event(conn, "$n2", "room.name", "");
                set_pointer(conn, &room, "room.name", "", second)?;

                let current = get_state(conn, &room, "room.name", "")?.unwrap();
                assert_eq!(current.id, EventId::from("$n2"));
                assert_eq!(room_state(conn, &room)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn state_of_kind_lists_all_keys() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let room = RoomId::from("!r:x");
                for (id, key) in [("$m1", "@a:x"), ("$m2", "@b:x")] {
                    let row = state_event(conn, id, "room.member", key);
                    set_pointer(conn, &room, "room.member", key, row)?;
                }
                let members = state_of_kind(conn, &room, "room.member")?;
                assert_eq!(members.len(), 2);
                Ok(())
            })
            .unwrap();
    }
}
