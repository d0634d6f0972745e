//! Timeline ordering: a dense, independently-signed sequence per room.
//! Live events append with positive numbers; paginated-in history prepends
//! with negative numbers reserved from the store-global counter, so the two
//! can never collide.

use rusqlite::{Connection, params};

use harbor_types::{Event, EventId, EventRowId, RoomId};

use crate::rows::{EVENT_COLS, map_event_at};
use crate::{OptionalExt, Result, Store};

/// Appends an event at the next positive sequence number. Returns the
/// assigned seq, or `None` when the (room, event) pair already exists.
pub fn append(conn: &Connection, room_id: &RoomId, rowid: EventRowId) -> Result<Option<i64>> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM timeline WHERE room_id = ?1 AND seq > 0",
        [&room_id.0],
        |row| row.get(0),
    )?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO timeline (room_id, seq, event_rowid) VALUES (?1, ?2, ?3)",
        params![room_id.0, next.max(1), rowid.0],
    )?;
    Ok((inserted > 0).then_some(next.max(1)))
}

/// Prepends an event at a caller-reserved negative sequence number.
/// Returns false when the (room, event) pair already exists.
pub fn prepend(conn: &Connection, room_id: &RoomId, rowid: EventRowId, seq: i64) -> Result<bool> {
    debug_assert!(seq < 0, "prepend seq must be negative");
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO timeline (room_id, seq, event_rowid) VALUES (?1, ?2, ?3)",
        params![room_id.0, seq, rowid.0],
    )?;
    Ok(inserted > 0)
}

pub fn contains(conn: &Connection, room_id: &RoomId, rowid: EventRowId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM timeline WHERE room_id = ?1 AND event_rowid = ?2",
            params![room_id.0, rowid.0],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Drops the cached ordering for a room. Used when a gappy sync makes the
/// local timeline non-contiguous with the server's.
pub fn clear(conn: &Connection, room_id: &RoomId) -> Result<()> {
    conn.execute("DELETE FROM timeline WHERE room_id = ?1", [&room_id.0])?;
    Ok(())
}

/// The sequence number of a known event in a room's timeline.
pub fn seq_of(conn: &Connection, room_id: &RoomId, event_id: &EventId) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT t.seq FROM timeline t JOIN events e ON e.id = t.event_rowid
         WHERE t.room_id = ?1 AND e.event_id = ?2",
        params![room_id.0, event_id.0],
        |row| row.get(0),
    )
    .optional()
}

pub fn oldest_seq(conn: &Connection, room_id: &RoomId) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MIN(seq) FROM timeline WHERE room_id = ?1",
        [&room_id.0],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()
    .map(|v| v.flatten())
}

pub fn newest_seq(conn: &Connection, room_id: &RoomId) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(seq) FROM timeline WHERE room_id = ?1",
        [&room_id.0],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()
    .map(|v| v.flatten())
}

/// A page of events strictly older than `before` (or from the newest end
/// when `before` is `None`), newest first.
pub fn page_before(
    conn: &Connection,
    room_id: &RoomId,
    before: Option<i64>,
    limit: u32,
) -> Result<Vec<(i64, Event)>> {
    let cutoff = before.unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&format!(
        "SELECT t.seq, {EVENT_COLS} FROM timeline t JOIN events e ON e.id = t.event_rowid
         WHERE t.room_id = ?1 AND t.seq < ?2
         ORDER BY t.seq DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![room_id.0, cutoff, limit], |row| {
            let seq: i64 = row.get(0)?;
            let event = map_event_at(row, 1)?;
            Ok((seq, event))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The most recent timeline events, oldest first, used for boundary scans.
pub fn tail(conn: &Connection, room_id: &RoomId, limit: u32) -> Result<Vec<(i64, Event)>> {
    let mut page = page_before(conn, room_id, None, limit)?;
    page.reverse();
    Ok(page)
}

/// Recounts unread totals from scratch: events strictly after the read
/// boundary, summed per severity. The safe fallback whenever incremental
/// accounting is in doubt.
pub fn recount_unread(
    conn: &Connection,
    room_id: &RoomId,
    boundary_seq: Option<i64>,
) -> Result<(i64, i64, i64)> {
    let boundary = boundary_seq.unwrap_or(i64::MIN);
    conn.query_row(
        "SELECT COALESCE(SUM(e.unread_highlight), 0),
                COALESCE(SUM(e.unread_notify), 0),
                COALESCE(SUM(e.unread_message), 0)
         FROM timeline t JOIN events e ON e.id = t.event_rowid
         WHERE t.room_id = ?1 AND t.seq > ?2 AND e.redacted_by IS NULL",
        params![room_id.0, boundary],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .map_err(Into::into)
}

impl Store {
    pub fn timeline_page(
        &self,
        room_id: &RoomId,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<(i64, Event)>> {
        self.with_conn(|conn| page_before(conn, room_id, before, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NewEvent, upsert_event};
    use harbor_types::UserId;

    fn insert(conn: &Connection, id: &str) -> EventRowId {
        let ev = NewEvent::plain(
            EventId::from(id),
            RoomId::from("!r:x"),
            UserId::from("@u:x"),
            "room.message",
            1,
            serde_json::json!({"body": id}),
        );
        upsert_event(conn, &ev).unwrap().0
    }

    #[test]
    fn append_assigns_dense_positive_seqs() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let room = RoomId::from("!r:x");
                let a = insert(conn, "$a");
                let b = insert(conn, "$b");
                assert_eq!(append(conn, &room, a)?, Some(1));
                assert_eq!(append(conn, &room, b)?, Some(2));
                // same pair again: ignored
                assert_eq!(append(conn, &room, a)?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn prepended_history_sorts_before_live_events() {
        let store = Store::in_memory().unwrap();
        let room = RoomId::from("!r:x");
        store
            .with_conn(|conn| {
                let live = insert(conn, "$live");
                append(conn, &room, live)?;
                Ok(())
            })
            .unwrap();

        let seq = store.reserve_prepend(2);
        store
            .with_conn(|conn| {
                let old1 = insert(conn, "$old1");
                let old2 = insert(conn, "$old2");
                assert!(prepend(conn, &room, old1, seq)?);
                assert!(prepend(conn, &room, old2, seq - 1)?);
                Ok(())
            })
            .unwrap();

        let page = store.timeline_page(&room, None, 10).unwrap();
        let ids: Vec<&str> = page.iter().map(|(_, e)| e.id.0.as_str()).collect();
        // newest first: live event, then progressively older history
        assert_eq!(ids, vec!["$live", "$old1", "$old2"]);
    }

    #[test]
    fn recount_respects_boundary_and_redactions() {
        let store = Store::in_memory().unwrap();
        let room = RoomId::from("!r:x");
        store
            .with_conn(|conn| {
                for (id, notify) in [("$a", true), ("$b", true), ("$c", false)] {
                    let mut ev = NewEvent::plain(
                        EventId::from(id),
                        room.clone(),
                        UserId::from("@peer:x"),
                        "room.message",
                        1,
                        serde_json::json!({"body": id}),
                    );
                    ev.unread.notify = notify;
                    ev.unread.message = true;
                    let (row, _) = upsert_event(conn, &ev)?;
                    append(conn, &room, row)?;
                }

                // everything unread
                assert_eq!(recount_unread(conn, &room, None)?, (0, 2, 3));
                // boundary after $a
                assert_eq!(recount_unread(conn, &room, Some(1))?, (0, 1, 2));

                // redacting $b removes its contribution
                let b = crate::events::get_by_event_id(conn, &EventId::from("$b"))?.unwrap();
                crate::events::set_redacted(conn, b.rowid, &EventId::from("$redaction"))?;
                assert_eq!(recount_unread(conn, &room, None)?, (0, 1, 2));
                Ok(())
            })
            .unwrap();
    }
}
