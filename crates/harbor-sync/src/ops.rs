//! Client-initiated operations: sending, read markers, manual unread.
//! Each persists first, then publishes its change through the buffer.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use harbor_crypto::{CryptoProvider, EventSender};
use harbor_store::events::{NewEvent, upsert_event};
use harbor_store::{Store, StoreError, events, receipts, rooms, timeline};
use harbor_types::{
    ChangeSet, Event, EventId, PushEvent, Receipt, ReceiptKind, Room, RoomChange, RoomId,
    SessionId, kinds,
};

use crate::merge::{RoomProposal, merge};
use crate::processor::read_boundary;

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encryption failed: {0}")]
    Encrypt(#[source] anyhow::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(EventId),
}

pub struct ClientOps {
    store: Arc<Store>,
    crypto: Arc<dyn CryptoProvider>,
    sender: Arc<dyn EventSender>,
    publish: mpsc::Sender<PushEvent>,
}

impl ClientOps {
    pub fn new(
        store: Arc<Store>,
        crypto: Arc<dyn CryptoProvider>,
        sender: Arc<dyn EventSender>,
        publish: mpsc::Sender<PushEvent>,
    ) -> Self {
        Self {
            store,
            crypto,
            sender,
            publish,
        }
    }

    /// Stores a locally-originated event under a placeholder id and hands
    /// it to the network. The server echo later collapses into the same row
    /// via the transaction id.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        kind: &str,
        content: &serde_json::Value,
    ) -> Result<Event, OpsError> {
        let account = self.store.account()?.ok_or(StoreError::NoAccount)?;
        let room = self
            .store
            .get_room(room_id)?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;

        let txn_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let mut new_event = if room.encryption.is_some() {
            let ciphertext = self
                .crypto
                .encrypt(room_id, kind, content)
                .map_err(OpsError::Encrypt)?;
            let mut ev = NewEvent::plain(
                EventId::placeholder(&txn_id),
                room_id.clone(),
                account.user_id.clone(),
                kinds::ENCRYPTED,
                now,
                ciphertext.clone(),
            );
            ev.decrypted = Some(content.clone());
            ev.decrypted_kind = Some(kind.to_string());
            ev.session_id = ciphertext
                .get("session_id")
                .and_then(serde_json::Value::as_str)
                .map(|s| SessionId(s.to_string()));
            ev.message_index = ciphertext
                .get("index")
                .and_then(serde_json::Value::as_u64)
                .map(|i| i as u32);
            ev
        } else {
            NewEvent::plain(
                EventId::placeholder(&txn_id),
                room_id.clone(),
                account.user_id.clone(),
                kind,
                now,
                content.clone(),
            )
        };
        new_event.txn_id = Some(txn_id.clone());

        let (event, merged) = self.store.with_txn(|txn| {
            let (rowid, _) = upsert_event(txn, &new_event)?;
            timeline::append(txn, room_id, rowid)?;

            let proposal = RoomProposal {
                preview_event: Some(rowid),
                sorting_timestamp: Some(now),
                ..Default::default()
            };
            let (merged, changed) = merge(&proposal, &room);
            if changed {
                rooms::save_room(txn, &merged)?;
            }
            let event = events::get_by_rowid(txn, rowid)?
                .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
            Ok((event, merged))
        })?;

        // delivery is fire-and-forget: the row stays pending until the echo
        let wire_content = &new_event.content;
        if let Err(e) = self
            .sender
            .send(room_id, &txn_id, &new_event.kind, wire_content)
            .await
        {
            warn!("network send of {} failed, row stays pending: {e:#}", txn_id);
        }

        self.publish_room_change(merged, vec![event.clone()], Vec::new())
            .await;
        Ok(event)
    }

    /// Records the local user's read receipt at `event_id`, recounts the
    /// unread totals from the new boundary, and clears the manual flag.
    pub async fn mark_read(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Room, OpsError> {
        let account = self.store.account()?.ok_or(StoreError::NoAccount)?;
        let room = self
            .store
            .get_room(room_id)?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
        if self.store.get_event(event_id)?.is_none() {
            return Err(OpsError::UnknownEvent(event_id.clone()));
        }

        let receipt = Receipt {
            room_id: room_id.clone(),
            user_id: account.user_id.clone(),
            kind: ReceiptKind::Read,
            thread: None,
            event_id: event_id.clone(),
            ts: Utc::now().timestamp_millis(),
        };

        let merged = self.store.with_txn(|txn| {
            receipts::upsert_receipt(txn, &receipt)?;
            let boundary = read_boundary(txn, room_id, &account)?;
            let (highlights, notifications, messages) =
                timeline::recount_unread(txn, room_id, boundary)?;

            let proposal = RoomProposal {
                unread: Some((highlights, notifications, messages)),
                marked_unread: Some(false),
                ..Default::default()
            };
            let (merged, changed) = merge(&proposal, &room);
            if changed {
                rooms::save_room(txn, &merged)?;
            }
            Ok(merged)
        })?;

        self.publish_room_change(merged.clone(), Vec::new(), vec![receipt])
            .await;
        Ok(merged)
    }

    /// Toggles the manual "marked unread" flag.
    pub async fn set_marked_unread(
        &self,
        room_id: &RoomId,
        unread: bool,
    ) -> Result<Room, OpsError> {
        let mut room = self
            .store
            .get_room(room_id)?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
        if room.marked_unread != unread {
            self.store
                .with_conn(|conn| rooms::set_marked_unread(conn, room_id, unread))?;
            room.marked_unread = unread;
            self.publish_room_change(room.clone(), Vec::new(), Vec::new())
                .await;
        }
        Ok(room)
    }

    async fn publish_room_change(&self, room: Room, events: Vec<Event>, receipts: Vec<Receipt>) {
        let mut change = RoomChange::new(room);
        for event in events {
            change.push_event(event);
        }
        change.receipts = receipts;
        let push = PushEvent::SyncComplete {
            changes: ChangeSet {
                rooms: vec![change],
                account_data: Vec::new(),
                left_rooms: Vec::new(),
            },
        };
        if self.publish.send(push).await.is_err() {
            warn!("event pipeline closed, dropping local change");
        }
    }
}
