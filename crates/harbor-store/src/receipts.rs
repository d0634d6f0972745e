//! Read receipts, latest-wins per (room, user, kind, thread).

use rusqlite::{Connection, params};

use harbor_types::{EventId, Receipt, ReceiptKind, RoomId, UserId};

use crate::{OptionalExt, Result, Store};

fn kind_str(kind: ReceiptKind) -> &'static str {
    kind.as_str()
}

fn kind_from(raw: &str) -> ReceiptKind {
    match raw {
        "read_private" => ReceiptKind::ReadPrivate,
        _ => ReceiptKind::Read,
    }
}

/// Stores a receipt; an older receipt for the same slot is overwritten.
pub fn upsert_receipt(conn: &Connection, receipt: &Receipt) -> Result<()> {
    conn.execute(
        "INSERT INTO receipts (room_id, user_id, kind, thread, event_id, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(room_id, user_id, kind, thread) DO UPDATE SET
             event_id = excluded.event_id, ts = excluded.ts",
        params![
            receipt.room_id.0,
            receipt.user_id.0,
            kind_str(receipt.kind),
            receipt.thread.as_deref().unwrap_or(""),
            receipt.event_id.0,
            receipt.ts,
        ],
    )?;
    Ok(())
}

/// The unthreaded receipt for one user in a room.
pub fn get_receipt(
    conn: &Connection,
    room_id: &RoomId,
    user_id: &UserId,
    kind: ReceiptKind,
) -> Result<Option<Receipt>> {
    conn.query_row(
        "SELECT event_id, ts FROM receipts
         WHERE room_id = ?1 AND user_id = ?2 AND kind = ?3 AND thread = ''",
        params![room_id.0, user_id.0, kind_str(kind)],
        |row| {
            Ok(Receipt {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                kind,
                thread: None,
                event_id: EventId(row.get(0)?),
                ts: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Everyone's receipts pointing at one event.
pub fn receipts_for_event(
    conn: &Connection,
    room_id: &RoomId,
    event_id: &EventId,
) -> Result<Vec<Receipt>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, kind, thread, ts FROM receipts
         WHERE room_id = ?1 AND event_id = ?2 ORDER BY user_id",
    )?;
    let receipts = stmt
        .query_map(params![room_id.0, event_id.0], |row| {
            let thread: String = row.get(2)?;
            Ok(Receipt {
                room_id: room_id.clone(),
                user_id: UserId(row.get(0)?),
                kind: kind_from(&row.get::<_, String>(1)?),
                thread: (!thread.is_empty()).then_some(thread),
                event_id: event_id.clone(),
                ts: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(receipts)
}

impl Store {
    pub fn receipts_for_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<Receipt>> {
        self.with_conn(|conn| receipts_for_event(conn, room_id, event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(user: &str, event: &str, ts: i64) -> Receipt {
        Receipt {
            room_id: RoomId::from("!r:x"),
            user_id: UserId::from(user),
            kind: ReceiptKind::Read,
            thread: None,
            event_id: EventId::from(event),
            ts,
        }
    }

    #[test]
    fn latest_receipt_wins() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                upsert_receipt(conn, &receipt("@u:x", "$old", 1))?;
                upsert_receipt(conn, &receipt("@u:x", "$new", 2))?;

                let r = get_receipt(
                    conn,
                    &RoomId::from("!r:x"),
                    &UserId::from("@u:x"),
                    ReceiptKind::Read,
                )?
                .unwrap();
                assert_eq!(r.event_id, EventId::from("$new"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn threaded_and_unthreaded_slots_are_separate() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                upsert_receipt(conn, &receipt("@u:x", "$main", 1))?;
                let mut threaded = receipt("@u:x", "$thread", 2);
                threaded.thread = Some("$root".into());
                upsert_receipt(conn, &threaded)?;

                let r = get_receipt(
                    conn,
                    &RoomId::from("!r:x"),
                    &UserId::from("@u:x"),
                    ReceiptKind::Read,
                )?
                .unwrap();
                assert_eq!(r.event_id, EventId::from("$main"));

                let at_thread =
                    receipts_for_event(conn, &RoomId::from("!r:x"), &EventId::from("$thread"))?;
                assert_eq!(at_thread.len(), 1);
                assert_eq!(at_thread[0].thread.as_deref(), Some("$root"));
                Ok(())
            })
            .unwrap();
    }
}
