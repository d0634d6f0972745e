//! The bridge seam: the daemon's side of the federated network. A bridge
//! process owns the wire protocol and exchanges data with the engine over
//! three local routes: it POSTs incremental sync batches in, long-polls an
//! outbox of engine-originated traffic, and POSTs replies to the tagged
//! requests in that outbox (history pages, key-backup lookups).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use harbor_crypto::{DeviceDirectory, EventSender, ExportedSession, KeyBackup};
use harbor_sync::paginate::{HistoryPage, HistorySource};
use harbor_sync::run::SyncSource;
use harbor_types::{RoomId, SessionId, SyncPayload, UserId};

/// How long a tagged request waits for the bridge before failing.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbox entry. Tagged kinds expect a `/bridge/reply` carrying the
/// same tag; the rest are fire-and-forget deliveries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeFrame {
    SendEvent {
        room_id: RoomId,
        txn_id: String,
        #[serde(rename = "type")]
        event_kind: String,
        content: Value,
    },
    RequestSession {
        room_id: RoomId,
        session_id: SessionId,
        from: UserId,
    },
    UploadSessions {
        sessions: Vec<ExportedSession>,
    },
    FetchSession {
        tag: u64,
        room_id: RoomId,
        session_id: SessionId,
    },
    PageHistory {
        tag: u64,
        room_id: RoomId,
        from: String,
        limit: u32,
    },
}

pub struct Bridge {
    sync_tx: mpsc::Sender<SyncPayload>,
    sync_rx: tokio::sync::Mutex<mpsc::Receiver<SyncPayload>>,
    outbox_tx: mpsc::Sender<BridgeFrame>,
    outbox_rx: tokio::sync::Mutex<mpsc::Receiver<BridgeFrame>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_tag: AtomicU64,
}

impl Bridge {
    pub fn new(queue: usize) -> Self {
        let (sync_tx, sync_rx) = mpsc::channel(queue);
        let (outbox_tx, outbox_rx) = mpsc::channel(queue);
        Self {
            sync_tx,
            sync_rx: tokio::sync::Mutex::new(sync_rx),
            outbox_tx,
            outbox_rx: tokio::sync::Mutex::new(outbox_rx),
            pending: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Queues one incoming sync batch for the sync loop.
    pub async fn ingest(&self, payload: SyncPayload) -> anyhow::Result<()> {
        self.sync_tx
            .send(payload)
            .await
            .map_err(|_| anyhow!("sync feed closed"))
    }

    /// The next outbox frame, awaited by the bridge's long poll.
    pub async fn next_outbox(&self) -> Option<BridgeFrame> {
        self.outbox_rx.lock().await.recv().await
    }

    /// Resolves a tagged request. Returns whether the tag was in flight.
    pub fn reply(&self, tag: u64, data: Value) -> bool {
        let waiter = self
            .pending
            .lock()
            .expect("bridge pending lock poisoned")
            .remove(&tag);
        match waiter {
            Some(tx) => tx.send(data).is_ok(),
            None => {
                warn!("bridge reply for unknown tag {tag}");
                false
            }
        }
    }

    async fn post(&self, frame: BridgeFrame) -> anyhow::Result<()> {
        self.outbox_tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("bridge outbox closed"))
    }

    /// Posts a tagged frame and waits for its reply.
    async fn request(&self, make: impl FnOnce(u64) -> BridgeFrame) -> anyhow::Result<Value> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("bridge pending lock poisoned")
            .insert(tag, tx);

        if let Err(e) = self.post(make(tag)).await {
            self.forget(tag);
            return Err(e);
        }
        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.forget(tag);
                bail!("bridge dropped request {tag}")
            }
            Err(_) => {
                self.forget(tag);
                bail!("bridge request {tag} timed out")
            }
        }
    }

    fn forget(&self, tag: u64) {
        self.pending
            .lock()
            .expect("bridge pending lock poisoned")
            .remove(&tag);
    }
}

#[async_trait]
impl SyncSource for Bridge {
    /// The bridge pushes batches in order, so the cursor is only advisory
    /// here; it matters to the bridge's own resume against the server.
    async fn next_batch(&self, _since: Option<&str>) -> anyhow::Result<SyncPayload> {
        self.sync_rx
            .lock()
            .await
            .recv()
            .await
            .context("sync feed closed")
    }
}

#[async_trait]
impl EventSender for Bridge {
    async fn send(
        &self,
        room_id: &RoomId,
        txn_id: &str,
        kind: &str,
        content: &Value,
    ) -> anyhow::Result<()> {
        self.post(BridgeFrame::SendEvent {
            room_id: room_id.clone(),
            txn_id: txn_id.to_string(),
            event_kind: kind.to_string(),
            content: content.clone(),
        })
        .await
    }
}

#[async_trait]
impl HistorySource for Bridge {
    async fn page_before(
        &self,
        room_id: &RoomId,
        from: &str,
        limit: u32,
    ) -> anyhow::Result<HistoryPage> {
        let room_id = room_id.clone();
        let from = from.to_string();
        let reply = self
            .request(|tag| BridgeFrame::PageHistory {
                tag,
                room_id,
                from,
                limit,
            })
            .await?;
        let page: HistoryPageReply =
            serde_json::from_value(reply).context("malformed history page from bridge")?;
        Ok(HistoryPage {
            events: page.events,
            end: page.end,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct HistoryPageReply {
    #[serde(default)]
    events: Vec<harbor_types::PduEvent>,
    end: Option<String>,
}

#[async_trait]
impl KeyBackup for Bridge {
    async fn fetch_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> anyhow::Result<Option<ExportedSession>> {
        let room_id = room_id.clone();
        let session_id = session_id.clone();
        let reply = self
            .request(|tag| BridgeFrame::FetchSession {
                tag,
                room_id,
                session_id,
            })
            .await?;
        if reply.is_null() {
            return Ok(None);
        }
        let export = serde_json::from_value(reply).context("malformed session from bridge")?;
        Ok(Some(export))
    }

    async fn upload_sessions(&self, sessions: &[ExportedSession]) -> anyhow::Result<()> {
        self.post(BridgeFrame::UploadSessions {
            sessions: sessions.to_vec(),
        })
        .await
    }
}

#[async_trait]
impl DeviceDirectory for Bridge {
    /// Device-list tracking lives on the bridge side; shared sessions come
    /// back as to-device messages in the sync feed.
    async fn stale_users(&self) -> anyhow::Result<Vec<UserId>> {
        Ok(Vec::new())
    }

    async fn refresh_user(&self, _user: &UserId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn request_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
        from: &UserId,
    ) -> anyhow::Result<()> {
        debug!("asking bridge for session {session_id} in {room_id}");
        self.post(BridgeFrame::RequestSession {
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            from: from.clone(),
        })
        .await
    }
}
