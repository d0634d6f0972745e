//! Typed handlers behind the command envelope. Each returns the response
//! payload for a `response` frame; failures become `error` frames scoped
//! to the request id and never tear down the connection.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use harbor_store::{Store, StoreError};
use harbor_sync::{ClientOps, OpsError, PaginateError, Paginator, spaces};
use harbor_types::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ops(#[from] OpsError),

    #[error(transparent)]
    Paginate(#[from] PaginateError),

    #[error("encoding response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request cancelled")]
    Cancelled,
}

/// The engine surface one connection's commands run against.
pub struct CommandHost {
    store: Arc<Store>,
    ops: Arc<ClientOps>,
    paginator: Arc<Paginator>,
}

impl CommandHost {
    pub fn new(store: Arc<Store>, ops: Arc<ClientOps>, paginator: Arc<Paginator>) -> Self {
        Self {
            store,
            ops,
            paginator,
        }
    }

    pub async fn dispatch(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<Value, CommandError> {
        match command {
            Command::Paginate {
                room_id,
                before,
                limit,
            } => {
                let page = self.paginator.paginate(&room_id, before, limit, cancel).await?;
                Ok(json!({ "events": page.events, "has_more": page.has_more }))
            }

            // intercepted by the connection loop before dispatch
            Command::Cancel { .. } => Ok(Value::Null),

            Command::SendMessage {
                room_id,
                kind,
                content,
            } => {
                let event = self.ops.send_message(&room_id, &kind, &content).await?;
                Ok(serde_json::to_value(event)?)
            }

            Command::MarkRead { room_id, event_id } => {
                let room = self.ops.mark_read(&room_id, &event_id).await?;
                Ok(serde_json::to_value(room)?)
            }

            Command::SetMarkedUnread { room_id, unread } => {
                let room = self.ops.set_marked_unread(&room_id, unread).await?;
                Ok(serde_json::to_value(room)?)
            }

            Command::GetRoomState { room_id } => {
                let events = self.store.room_state(&room_id)?;
                Ok(json!({ "events": events }))
            }

            Command::GetEvent { room_id, event_id } => {
                let event = self
                    .store
                    .get_event(&event_id)?
                    .filter(|e| e.room_id == room_id)
                    .ok_or_else(|| CommandError::NotFound(event_id.0.clone()))?;
                Ok(serde_json::to_value(event)?)
            }

            Command::GetReceipts { room_id, event_id } => {
                let receipts = self.store.receipts_for_event(&room_id, &event_id)?;
                Ok(json!({ "receipts": receipts }))
            }

            Command::GetSpaceHierarchy { space_id } => {
                let children = self
                    .store
                    .with_conn(|conn| spaces::hierarchy(conn, &space_id))?;
                Ok(json!({ "children": children }))
            }
        }
    }
}

/// A host over silent network fakes, shared by tests across the crate.
#[cfg(test)]
pub(crate) fn test_host(store: Arc<Store>) -> CommandHost {
    use async_trait::async_trait;
    use harbor_crypto::{CryptoProvider, EventSender, LocalCrypto};
    use harbor_sync::paginate::{HistoryPage, HistorySource, PaginationRegistry};
    use harbor_types::RoomId;
    use tokio::sync::mpsc;

    struct Silent;

    #[async_trait]
    impl EventSender for Silent {
        async fn send(
            &self,
            _room_id: &RoomId,
            _txn_id: &str,
            _kind: &str,
            _content: &Value,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl HistorySource for Silent {
        async fn page_before(
            &self,
            _room_id: &RoomId,
            _from: &str,
            _limit: u32,
        ) -> anyhow::Result<HistoryPage> {
            Ok(HistoryPage {
                events: Vec::new(),
                end: None,
            })
        }
    }

    let crypto: Arc<dyn CryptoProvider> = Arc::new(LocalCrypto::new());
    let (tx, _rx) = mpsc::channel(16);
    let ops = Arc::new(ClientOps::new(
        store.clone(),
        crypto.clone(),
        Arc::new(Silent),
        tx.clone(),
    ));
    let paginator = Arc::new(Paginator::new(
        store.clone(),
        crypto,
        Arc::new(Silent),
        Arc::new(PaginationRegistry::new()),
        tx,
    ));
    CommandHost::new(store, ops, paginator)
}
