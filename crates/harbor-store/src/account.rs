//! The single local account row. The batch cursor is advanced last in every
//! sync transaction, so a crash never moves it past unpersisted data.

use rusqlite::{Connection, params};

use harbor_types::{Account, UserId};

use crate::{OptionalExt, Result, Store, StoreError};

pub fn put_account(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        "INSERT INTO account (id, user_id, device_id, access_token, next_batch)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             user_id = excluded.user_id,
             device_id = excluded.device_id,
             access_token = excluded.access_token,
             next_batch = excluded.next_batch",
        params![
            account.user_id.0,
            account.device_id,
            account.access_token,
            account.next_batch,
        ],
    )?;
    Ok(())
}

pub fn get_account(conn: &Connection) -> Result<Option<Account>> {
    conn.query_row(
        "SELECT user_id, device_id, access_token, next_batch FROM account WHERE id = 1",
        [],
        |row| {
            Ok(Account {
                user_id: UserId(row.get(0)?),
                device_id: row.get(1)?,
                access_token: row.get(2)?,
                next_batch: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Advances the batch cursor. Fails if no account is configured.
pub fn set_next_batch(conn: &Connection, next_batch: &str) -> Result<()> {
    let affected = conn.execute(
        "UPDATE account SET next_batch = ?1 WHERE id = 1",
        [next_batch],
    )?;
    if affected == 0 {
        return Err(StoreError::NoAccount);
    }
    Ok(())
}

/// Stores one account-data blob, replacing any previous value of the type.
pub fn put_account_data(conn: &Connection, kind: &str, content: &serde_json::Value) -> Result<()> {
    conn.execute(
        "INSERT INTO account_data (type, content) VALUES (?1, ?2)
         ON CONFLICT(type) DO UPDATE SET content = excluded.content",
        params![kind, content.to_string()],
    )?;
    Ok(())
}

pub fn get_account_data(conn: &Connection, kind: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT content FROM account_data WHERE type = ?1",
            [kind],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

impl Store {
    pub fn account(&self) -> Result<Option<Account>> {
        self.with_conn(get_account)
    }

    pub fn put_account(&self, account: &Account) -> Result<()> {
        self.with_conn(|conn| put_account(conn, account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            user_id: UserId::from("@me:x"),
            device_id: "DEVICE".into(),
            access_token: "secret".into(),
            next_batch: None,
        }
    }

    #[test]
    fn round_trip_and_cursor_advance() {
        let store = Store::in_memory().unwrap();
        store.put_account(&account()).unwrap();

        store
            .with_conn(|conn| set_next_batch(conn, "batch-2"))
            .unwrap();

        let loaded = store.account().unwrap().unwrap();
        assert_eq!(loaded.next_batch.as_deref(), Some("batch-2"));
    }

    #[test]
    fn cursor_advance_without_account_fails() {
        let store = Store::in_memory().unwrap();
        let err = store.with_conn(|conn| set_next_batch(conn, "b")).unwrap_err();
        assert!(matches!(err, StoreError::NoAccount));
    }
}
