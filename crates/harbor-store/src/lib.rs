//! The durable local mirror: rooms, events, timeline order, current-state
//! pointers, space edges, receipts, session requests, media references and
//! the local account, all in one SQLite database.
//!
//! SQLite is the only durable store. Every multi-row write for one sync
//! batch happens inside a single transaction, so a crash mid-batch cannot
//! leave partial room state.

pub mod account;
pub mod events;
mod migrations;
pub mod receipts;
pub mod rooms;
mod rows;
pub mod sessions;
pub mod spaces;
pub mod state;
pub mod timeline;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use rusqlite::{Connection, Transaction};
use tracing::info;

use harbor_types::RoomId;

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored JSON corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("no account configured")]
    NoAccount,

    #[error("room not found: {0}")]
    RoomNotFound(RoomId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the SQLite mirror. Writers serialize through the connection
/// lock; the lock is held only for statement execution, never across I/O.
pub struct Store {
    conn: Mutex<Connection>,
    /// Next negative sequence number handed out for prepended history.
    /// Seeded below the smallest seq present at open so paginated-in rows
    /// never collide with live appends.
    prepend_seq: AtomicI64,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self::init(conn)?;
        info!("store opened at {}", path.as_ref().display());
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        let min_seq: i64 = conn.query_row(
            "SELECT COALESCE(MIN(seq), 0) FROM timeline",
            [],
            |row| row.get(0),
        )?;
        let floor = min_seq.min(0);

        Ok(Self {
            conn: Mutex::new(conn),
            prepend_seq: AtomicI64::new(floor - 1),
        })
    }

    /// Runs `f` with the shared connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside a transaction. Any error rolls the whole batch back.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let txn = conn.transaction()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Reserves `n` strictly decreasing negative sequence numbers for
    /// prepended history and returns the highest of them. Ids skipped by a
    /// crash are wasted, which is harmless: the space is unbounded downward.
    pub fn reserve_prepend(&self, n: i64) -> i64 {
        self.prepend_seq.fetch_sub(n, Ordering::SeqCst)
    }
}

/// Maps a `QueryReturnedNoRows` error to `None`.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_and_reserve_prepend() {
        let store = Store::in_memory().unwrap();
        let a = store.reserve_prepend(3);
        let b = store.reserve_prepend(1);
        assert_eq!(a, -1);
        assert_eq!(b, -4);
    }

    #[test]
    fn txn_rolls_back_on_error() {
        let store = Store::in_memory().unwrap();
        let res: Result<()> = store.with_txn(|txn| {
            txn.execute(
                "INSERT INTO rooms (id, sorting_timestamp) VALUES ('!a', 1)",
                [],
            )?;
            Err(StoreError::NoAccount)
        });
        assert!(res.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
