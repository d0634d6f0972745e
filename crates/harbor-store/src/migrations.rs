use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS account (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            user_id         TEXT NOT NULL,
            device_id       TEXT NOT NULL,
            access_token    TEXT NOT NULL,
            next_batch      TEXT
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id                   TEXT PRIMARY KEY,
            create_content       TEXT,
            tombstone_content    TEXT,
            name                 TEXT,
            name_quality         INTEGER NOT NULL DEFAULT 0,
            avatar_url           TEXT,
            avatar_explicit      INTEGER NOT NULL DEFAULT 0,
            dm_user_id           TEXT,
            topic                TEXT,
            heroes               TEXT,
            joined_count         INTEGER NOT NULL DEFAULT 0,
            invited_count        INTEGER NOT NULL DEFAULT 0,
            encryption           TEXT,
            has_member_list      INTEGER NOT NULL DEFAULT 0,
            preview_event        INTEGER,
            sorting_timestamp    INTEGER NOT NULL DEFAULT 0,
            unread_highlights    INTEGER NOT NULL DEFAULT 0,
            unread_notifications INTEGER NOT NULL DEFAULT 0,
            unread_messages      INTEGER NOT NULL DEFAULT 0,
            marked_unread        INTEGER NOT NULL DEFAULT 0,
            prev_batch           TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id          TEXT NOT NULL UNIQUE,
            txn_id            TEXT UNIQUE,
            room_id           TEXT NOT NULL,
            sender            TEXT NOT NULL,
            type              TEXT NOT NULL,
            state_key         TEXT,
            origin_ts         INTEGER NOT NULL,
            content           TEXT NOT NULL,
            decrypted         TEXT,
            decrypted_type    TEXT,
            decryption_error  TEXT,
            decrypt_retryable INTEGER NOT NULL DEFAULT 0,
            session_id        TEXT,
            message_index     INTEGER,
            redacted_by       TEXT,
            relates_to        TEXT,
            relation_kind     TEXT,
            reactions         TEXT,
            last_edit         INTEGER,
            unread_highlight  INTEGER NOT NULL DEFAULT 0,
            unread_notify     INTEGER NOT NULL DEFAULT 0,
            unread_sound      INTEGER NOT NULL DEFAULT 0,
            unread_message    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_events_room
            ON events(room_id);
        CREATE INDEX IF NOT EXISTS idx_events_relates
            ON events(relates_to);
        CREATE INDEX IF NOT EXISTS idx_events_session
            ON events(room_id, session_id);

        CREATE TABLE IF NOT EXISTS timeline (
            room_id      TEXT NOT NULL,
            seq          INTEGER NOT NULL,
            event_rowid  INTEGER NOT NULL,
            PRIMARY KEY (room_id, seq),
            UNIQUE (room_id, event_rowid)
        );

        CREATE TABLE IF NOT EXISTS current_state (
            room_id      TEXT NOT NULL,
            type         TEXT NOT NULL,
            state_key    TEXT NOT NULL,
            event_rowid  INTEGER NOT NULL,
            PRIMARY KEY (room_id, type, state_key)
        );

        CREATE TABLE IF NOT EXISTS space_edges (
            space_id         TEXT NOT NULL,
            child_id         TEXT NOT NULL,
            child_event      INTEGER,
            ordering         TEXT,
            suggested        INTEGER NOT NULL DEFAULT 0,
            parent_event     INTEGER,
            canonical        INTEGER NOT NULL DEFAULT 0,
            parent_validated INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (space_id, child_id)
        );

        CREATE TABLE IF NOT EXISTS receipts (
            room_id   TEXT NOT NULL,
            user_id   TEXT NOT NULL,
            kind      TEXT NOT NULL,
            thread    TEXT NOT NULL DEFAULT '',
            event_id  TEXT NOT NULL,
            ts        INTEGER NOT NULL,
            PRIMARY KEY (room_id, user_id, kind, thread)
        );

        CREATE TABLE IF NOT EXISTS session_requests (
            room_id        TEXT NOT NULL,
            session_id     TEXT NOT NULL,
            sender         TEXT NOT NULL,
            min_index      INTEGER NOT NULL,
            backup_checked INTEGER NOT NULL DEFAULT 0,
            request_sent   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (room_id, session_id)
        );

        CREATE TABLE IF NOT EXISTS account_data (
            type     TEXT PRIMARY KEY,
            content  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS media_refs (
            event_rowid  INTEGER NOT NULL,
            locator      TEXT NOT NULL,
            PRIMARY KEY (event_rowid, locator)
        );
        ",
    )?;

    info!("store migrations complete");
    Ok(())
}
