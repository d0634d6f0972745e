//! Pending group-session requests: one queue row per missing session,
//! removed once the session arrives.

use rusqlite::{Connection, Row, params};

use harbor_types::{RoomId, SessionId, SessionRequest, UserId};

use crate::{Result, Store};

fn map_request(row: &Row<'_>) -> rusqlite::Result<SessionRequest> {
    Ok(SessionRequest {
        room_id: RoomId(row.get(0)?),
        session_id: SessionId(row.get(1)?),
        sender: UserId(row.get(2)?),
        min_index: row.get::<_, i64>(3)?.max(0) as u32,
        backup_checked: row.get::<_, i64>(4)? != 0,
        request_sent: row.get::<_, i64>(5)? != 0,
    })
}

/// Queues a request for a missing session. A repeat failure for the same
/// session only lowers the minimum needed ratchet index; checked/sent
/// progress is kept.
pub fn queue_request(
    conn: &Connection,
    room_id: &RoomId,
    session_id: &SessionId,
    sender: &UserId,
    index: u32,
) -> Result<()> {
    conn.execute(
        "INSERT INTO session_requests (room_id, session_id, sender, min_index)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(room_id, session_id) DO UPDATE SET
             min_index = MIN(min_index, excluded.min_index)",
        params![room_id.0, session_id.0, sender.0, index as i64],
    )?;
    Ok(())
}

/// Up to `limit` pending requests, least-progressed first (backup check
/// before device request).
pub fn pending_requests(conn: &Connection, limit: u32) -> Result<Vec<SessionRequest>> {
    let mut stmt = conn.prepare(
        "SELECT room_id, session_id, sender, min_index, backup_checked, request_sent
         FROM session_requests
         WHERE request_sent = 0
         ORDER BY backup_checked, room_id, session_id
         LIMIT ?1",
    )?;
    let requests = stmt
        .query_map([limit], map_request)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(requests)
}

pub fn mark_backup_checked(conn: &Connection, room_id: &RoomId, session_id: &SessionId) -> Result<()> {
    conn.execute(
        "UPDATE session_requests SET backup_checked = 1 WHERE room_id = ?1 AND session_id = ?2",
        params![room_id.0, session_id.0],
    )?;
    Ok(())
}

pub fn mark_request_sent(conn: &Connection, room_id: &RoomId, session_id: &SessionId) -> Result<()> {
    conn.execute(
        "UPDATE session_requests SET request_sent = 1 WHERE room_id = ?1 AND session_id = ?2",
        params![room_id.0, session_id.0],
    )?;
    Ok(())
}

/// Drops the queue row once the session is satisfied (or covered).
pub fn remove_request(conn: &Connection, room_id: &RoomId, session_id: &SessionId) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM session_requests WHERE room_id = ?1 AND session_id = ?2",
        params![room_id.0, session_id.0],
    )?;
    Ok(affected > 0)
}

pub fn get_request(
    conn: &Connection,
    room_id: &RoomId,
    session_id: &SessionId,
) -> Result<Option<SessionRequest>> {
    use crate::OptionalExt;
    conn.query_row(
        "SELECT room_id, session_id, sender, min_index, backup_checked, request_sent
         FROM session_requests WHERE room_id = ?1 AND session_id = ?2",
        params![room_id.0, session_id.0],
        map_request,
    )
    .optional()
}

impl Store {
    pub fn pending_session_requests(&self, limit: u32) -> Result<Vec<SessionRequest>> {
        self.with_conn(|conn| pending_requests(conn, limit))
    }
}
