//! Event rows. Content is append-once; decrypted/edit/redaction/reaction
//! fields are updated in place as later events reference the row.

use rusqlite::{Connection, params};
use serde_json::Value;
use std::collections::BTreeMap;

use harbor_types::{Event, EventId, EventRowId, RelationKind, RoomId, SessionId, UnreadFlags, UserId};

use crate::rows::{EVENT_COLS, map_event, relation_kind_str};
use crate::{OptionalExt, Result, Store};

/// Input for an event upsert.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: EventId,
    pub txn_id: Option<String>,
    pub room_id: RoomId,
    pub sender: UserId,
    pub kind: String,
    pub state_key: Option<String>,
    pub origin_ts: i64,
    pub content: Value,
    pub decrypted: Option<Value>,
    pub decrypted_kind: Option<String>,
    pub decryption_error: Option<String>,
    pub decrypt_retryable: bool,
    pub session_id: Option<SessionId>,
    pub message_index: Option<u32>,
    pub relates_to: Option<EventId>,
    pub relation_kind: Option<RelationKind>,
    pub unread: UnreadFlags,
}

impl NewEvent {
    /// A plain, already-plaintext event.
    pub fn plain(
        event_id: EventId,
        room_id: RoomId,
        sender: UserId,
        kind: impl Into<String>,
        origin_ts: i64,
        content: Value,
    ) -> Self {
        Self {
            event_id,
            txn_id: None,
            room_id,
            sender,
            kind: kind.into(),
            state_key: None,
            origin_ts,
            content,
            decrypted: None,
            decrypted_kind: None,
            decryption_error: None,
            decrypt_retryable: false,
            session_id: None,
            message_index: None,
            relates_to: None,
            relation_kind: None,
            unread: UnreadFlags::default(),
        }
    }
}

/// How an upsert resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created.
    Inserted,
    /// A server echo collapsed into the pending local send.
    Confirmed,
    /// The protocol id was already known; nothing changed.
    Known,
}

/// Idempotent upsert keyed on the protocol id and on the local txn id, so a
/// locally sent event and its server echo end up as one row.
pub fn upsert_event(conn: &Connection, ev: &NewEvent) -> Result<(EventRowId, UpsertOutcome)> {
    if let Some(txn_id) = &ev.txn_id {
        let pending: Option<i64> = conn
            .query_row(
                "SELECT id FROM events WHERE txn_id = ?1",
                [txn_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(rowid) = pending {
            conn.execute(
                "UPDATE events SET event_id = ?2, origin_ts = ?3 WHERE id = ?1",
                params![rowid, ev.event_id.0, ev.origin_ts],
            )?;
            return Ok((EventRowId(rowid), UpsertOutcome::Confirmed));
        }
    }

    let known: Option<i64> = conn
        .query_row(
            "SELECT id FROM events WHERE event_id = ?1",
            [&ev.event_id.0],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(rowid) = known {
        return Ok((EventRowId(rowid), UpsertOutcome::Known));
    }

    conn.execute(
        "INSERT INTO events (event_id, txn_id, room_id, sender, type, state_key, origin_ts,
             content, decrypted, decrypted_type, decryption_error, decrypt_retryable,
             session_id, message_index, relates_to, relation_kind,
             unread_highlight, unread_notify, unread_sound, unread_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20)",
        params![
            ev.event_id.0,
            ev.txn_id,
            ev.room_id.0,
            ev.sender.0,
            ev.kind,
            ev.state_key,
            ev.origin_ts,
            ev.content.to_string(),
            ev.decrypted.as_ref().map(Value::to_string),
            ev.decrypted_kind,
            ev.decryption_error,
            ev.decrypt_retryable as i64,
            ev.session_id.as_ref().map(|s| &s.0),
            ev.message_index,
            ev.relates_to.as_ref().map(|e| &e.0),
            ev.relation_kind.map(relation_kind_str),
            ev.unread.highlight as i64,
            ev.unread.notify as i64,
            ev.unread.sound as i64,
            ev.unread.message as i64,
        ],
    )?;
    Ok((EventRowId(conn.last_insert_rowid()), UpsertOutcome::Inserted))
}

pub fn get_by_rowid(conn: &Connection, rowid: EventRowId) -> Result<Option<Event>> {
    let mut stmt = conn.prepare(&format!("SELECT {EVENT_COLS} FROM events e WHERE e.id = ?1"))?;
    stmt.query_row([rowid.0], map_event).optional()
}

pub fn get_by_event_id(conn: &Connection, event_id: &EventId) -> Result<Option<Event>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {EVENT_COLS} FROM events e WHERE e.event_id = ?1"))?;
    stmt.query_row([&event_id.0], map_event).optional()
}

/// Marks a row decrypted, clearing any previous failure.
pub fn set_decrypted(
    conn: &Connection,
    rowid: EventRowId,
    decrypted: &Value,
    decrypted_kind: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE events SET decrypted = ?2, decrypted_type = ?3,
             decryption_error = NULL, decrypt_retryable = 0
         WHERE id = ?1",
        params![rowid.0, decrypted.to_string(), decrypted_kind],
    )?;
    Ok(())
}

/// Records a decryption failure. Retryable failures stay eligible for the
/// retry queue; terminal ones are permanent.
pub fn set_decrypt_failed(
    conn: &Connection,
    rowid: EventRowId,
    error: &str,
    retryable: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE events SET decryption_error = ?2, decrypt_retryable = ?3 WHERE id = ?1",
        params![rowid.0, error, retryable as i64],
    )?;
    Ok(())
}

pub fn set_redacted(conn: &Connection, rowid: EventRowId, by: &EventId) -> Result<()> {
    conn.execute(
        "UPDATE events SET redacted_by = ?2,
             unread_highlight = 0, unread_notify = 0, unread_sound = 0, unread_message = 0
         WHERE id = ?1",
        params![rowid.0, by.0],
    )?;
    Ok(())
}

pub fn set_last_edit(conn: &Connection, target: EventRowId, edit: EventRowId) -> Result<()> {
    conn.execute(
        "UPDATE events SET last_edit = ?2 WHERE id = ?1",
        params![target.0, edit.0],
    )?;
    Ok(())
}

pub fn clear_last_edit(conn: &Connection, target: EventRowId) -> Result<()> {
    conn.execute(
        "UPDATE events SET last_edit = NULL WHERE id = ?1",
        params![target.0],
    )?;
    Ok(())
}

pub fn set_unread(conn: &Connection, rowid: EventRowId, unread: UnreadFlags) -> Result<()> {
    conn.execute(
        "UPDATE events SET unread_highlight = ?2, unread_notify = ?3, unread_sound = ?4,
             unread_message = ?5
         WHERE id = ?1",
        params![
            rowid.0,
            unread.highlight as i64,
            unread.notify as i64,
            unread.sound as i64,
            unread.message as i64
        ],
    )?;
    Ok(())
}

/// Adjusts the reaction-count cache on the target row.
pub fn add_reaction(conn: &Connection, target: EventRowId, key: &str, delta: i64) -> Result<()> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT reactions FROM events WHERE id = ?1",
            [target.0],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let mut counts: BTreeMap<String, i64> = match raw {
        Some(s) => serde_json::from_str(&s)?,
        None => BTreeMap::new(),
    };
    let count = counts.entry(key.to_string()).or_insert(0);
    *count += delta;
    if *count <= 0 {
        counts.remove(key);
    }

    conn.execute(
        "UPDATE events SET reactions = ?2 WHERE id = ?1",
        params![target.0, serde_json::to_string(&counts)?],
    )?;
    Ok(())
}

/// Retryable failures for one group session whose ciphertext index the
/// session can now cover.
pub fn failed_events_for_session(
    conn: &Connection,
    room_id: &RoomId,
    session_id: &SessionId,
    min_index: u32,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLS} FROM events e
         WHERE e.room_id = ?1 AND e.session_id = ?2 AND e.decrypted IS NULL
           AND e.decrypt_retryable = 1 AND e.message_index >= ?3
         ORDER BY e.id"
    ))?;
    let events = stmt
        .query_map(params![room_id.0, session_id.0, min_index], map_event)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Raw ciphertext fields the retry queue needs to attempt a decrypt.
pub fn ciphertext_of(conn: &Connection, rowid: EventRowId) -> Result<Option<(Value, u32)>> {
    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT content, message_index FROM events WHERE id = ?1",
            [rowid.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((content, index)) => Ok(Some((
            serde_json::from_str(&content)?,
            index.unwrap_or(0).max(0) as u32,
        ))),
        None => Ok(None),
    }
}

pub fn add_media_ref(conn: &Connection, rowid: EventRowId, locator: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO media_refs (event_rowid, locator) VALUES (?1, ?2)",
        params![rowid.0, locator],
    )?;
    Ok(())
}

impl Store {
    pub fn get_event(&self, event_id: &EventId) -> Result<Option<Event>> {
        self.with_conn(|conn| get_by_event_id(conn, event_id))
    }

    pub fn get_event_row(&self, rowid: EventRowId) -> Result<Option<Event>> {
        self.with_conn(|conn| get_by_rowid(conn, rowid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(id: &str) -> NewEvent {
        NewEvent::plain(
            EventId::from(id),
            RoomId::from("!r:x"),
            UserId::from("@u:x"),
            "room.message",
            100,
            serde_json::json!({"body": "hi"}),
        )
    }

    #[test]
    fn upsert_is_idempotent_on_event_id() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let (row1, out1) = upsert_event(conn, &new_event("$a"))?;
                let (row2, out2) = upsert_event(conn, &new_event("$a"))?;
                assert_eq!(out1, UpsertOutcome::Inserted);
                assert_eq!(out2, UpsertOutcome::Known);
                assert_eq!(row1, row2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn server_echo_collapses_into_pending_send() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let mut local = new_event("~txn:t1");
                local.txn_id = Some("t1".into());
                let (pending_row, _) = upsert_event(conn, &local)?;

                let mut echo = new_event("$confirmed:x");
                echo.txn_id = Some("t1".into());
                echo.origin_ts = 200;
                let (echo_row, outcome) = upsert_event(conn, &echo)?;

                assert_eq!(outcome, UpsertOutcome::Confirmed);
                assert_eq!(pending_row, echo_row);

                let stored = get_by_rowid(conn, pending_row)?.unwrap();
                assert_eq!(stored.id, EventId::from("$confirmed:x"));
                assert_eq!(stored.origin_ts, 200);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn decrypted_update_clears_failure() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let (row, _) = upsert_event(conn, &new_event("$a"))?;
                set_decrypt_failed(conn, row, "no session", true)?;
                set_decrypted(conn, row, &serde_json::json!({"body": "hi"}), "room.message")?;

                let ev = get_by_rowid(conn, row)?.unwrap();
                assert!(ev.decryption_error.is_none());
                assert_eq!(ev.decrypted_kind.as_deref(), Some("room.message"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn reaction_cache_counts_up_and_down() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let (row, _) = upsert_event(conn, &new_event("$a"))?;
                add_reaction(conn, row, "+1", 1)?;
                add_reaction(conn, row, "+1", 1)?;
                add_reaction(conn, row, "eyes", 1)?;
                add_reaction(conn, row, "eyes", -1)?;

                let ev = get_by_rowid(conn, row)?.unwrap();
                assert_eq!(ev.reactions.get("+1"), Some(&2));
                assert!(!ev.reactions.contains_key("eyes"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_session_query_filters_by_index() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                for (id, index) in [("$e1", 1u32), ("$e2", 5), ("$e3", 9)] {
                    let mut ev = new_event(id);
                    ev.kind = "room.encrypted".into();
                    ev.session_id = Some(SessionId::from("sess"));
                    ev.message_index = Some(index);
                    ev.decrypt_retryable = true;
                    let (row, _) = upsert_event(conn, &ev)?;
                    set_decrypt_failed(conn, row, "no session", true)?;
                }

                let eligible = failed_events_for_session(
                    conn,
                    &RoomId::from("!r:x"),
                    &SessionId::from("sess"),
                    5,
                )?;
                let ids: Vec<&str> = eligible.iter().map(|e| e.id.0.as_str()).collect();
                assert_eq!(ids, vec!["$e2", "$e3"]);
                Ok(())
            })
            .unwrap();
    }
}
