//! History pagination: serve older timeline pages locally when possible,
//! otherwise fetch one page from the network. At most one network
//! pagination is in flight per room; a sync-driven timeline reset
//! interrupts it with a distinguishable cause.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harbor_crypto::CryptoProvider;
use harbor_store::events::{UpsertOutcome, upsert_event};
use harbor_store::{Store, StoreError, rooms, timeline};
use harbor_types::{Event, PduEvent, PushEvent, RoomId};

use crate::processor::build_timeline_event;

/// Why an in-flight pagination was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    /// Ordinary cooperative cancellation (client cancel, disconnect).
    Cancelled,
    /// A gappy sync cleared the room's timeline while the fetch ran.
    TimelineReset,
}

#[derive(Debug, thiserror::Error)]
pub enum PaginateError {
    #[error("pagination already in progress for this room")]
    AlreadyInProgress,

    #[error("pagination interrupted: timeline was reset")]
    TimelineReset,

    #[error("pagination cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("history source error: {0}")]
    Source(#[source] anyhow::Error),
}

/// One page fetched from the network. `end` is the cursor for the next
/// page; `None` means the server has no further history.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub events: Vec<PduEvent>,
    pub end: Option<String>,
}

/// The network side of pagination.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetches events older than `from`, newest first.
    async fn page_before(
        &self,
        room_id: &RoomId,
        from: &str,
        limit: u32,
    ) -> anyhow::Result<HistoryPage>;
}

struct InFlight {
    token: CancellationToken,
    cause: Arc<Mutex<InterruptCause>>,
}

/// Registry of in-flight network paginations, keyed by room. Registration
/// on start, guaranteed deregistration on every exit path via the guard.
#[derive(Default)]
pub struct PaginationRegistry {
    inner: Mutex<HashMap<RoomId, InFlight>>,
}

impl PaginationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(self: &Arc<Self>, room_id: &RoomId) -> Result<RegistryGuard, PaginateError> {
        let mut inner = self.inner.lock().expect("pagination registry poisoned");
        if inner.contains_key(room_id) {
            return Err(PaginateError::AlreadyInProgress);
        }
        let token = CancellationToken::new();
        let cause = Arc::new(Mutex::new(InterruptCause::Cancelled));
        inner.insert(
            room_id.clone(),
            InFlight {
                token: token.clone(),
                cause: cause.clone(),
            },
        );
        Ok(RegistryGuard {
            registry: self.clone(),
            room_id: room_id.clone(),
            token,
            cause,
        })
    }

    /// Trips the in-flight pagination for a room, recording why.
    pub fn interrupt(&self, room_id: &RoomId, cause: InterruptCause) {
        let inner = self.inner.lock().expect("pagination registry poisoned");
        if let Some(entry) = inner.get(room_id) {
            *entry.cause.lock().expect("interrupt cause poisoned") = cause;
            entry.token.cancel();
            debug!("interrupted pagination for {} ({cause:?})", room_id);
        }
    }
}

struct RegistryGuard {
    registry: Arc<PaginationRegistry>,
    room_id: RoomId,
    token: CancellationToken,
    cause: Arc<Mutex<InterruptCause>>,
}

impl RegistryGuard {
    fn interrupt_error(&self) -> PaginateError {
        match *self.cause.lock().expect("interrupt cause poisoned") {
            InterruptCause::TimelineReset => PaginateError::TimelineReset,
            InterruptCause::Cancelled => PaginateError::Cancelled,
        }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry
            .inner
            .lock()
            .expect("pagination registry poisoned")
            .remove(&self.room_id);
    }
}

/// A served page of history, oldest last (newest first, like the store's
/// timeline ordering).
#[derive(Debug)]
pub struct Page {
    pub events: Vec<Event>,
    pub has_more: bool,
}

pub struct Paginator {
    store: Arc<Store>,
    crypto: Arc<dyn CryptoProvider>,
    history: Arc<dyn HistorySource>,
    registry: Arc<PaginationRegistry>,
    publish: mpsc::Sender<PushEvent>,
}

impl Paginator {
    pub fn new(
        store: Arc<Store>,
        crypto: Arc<dyn CryptoProvider>,
        history: Arc<dyn HistorySource>,
        registry: Arc<PaginationRegistry>,
        publish: mpsc::Sender<PushEvent>,
    ) -> Self {
        Self {
            store,
            crypto,
            history,
            registry,
            publish,
        }
    }

    pub fn registry(&self) -> Arc<PaginationRegistry> {
        self.registry.clone()
    }

    /// Serves a page of events older than `before` from the local timeline,
    /// falling through to the network when the cache is exhausted.
    pub async fn paginate(
        &self,
        room_id: &RoomId,
        before: Option<i64>,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Page, PaginateError> {
        let local = self.store.timeline_page(room_id, before, limit)?;
        if !local.is_empty() {
            return Ok(Page {
                events: local.into_iter().map(|(_, ev)| ev).collect(),
                has_more: true,
            });
        }
        self.paginate_server(room_id, limit, cancel).await
    }

    /// One network pagination, serialized per room.
    async fn paginate_server(
        &self,
        room_id: &RoomId,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Page, PaginateError> {
        let guard = self.registry.register(room_id)?;

        let room = self
            .store
            .get_room(room_id)?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
        let Some(cursor) = room.prev_batch else {
            // never synced a cursor: nothing to fetch from
            return Ok(Page {
                events: Vec::new(),
                has_more: false,
            });
        };
        if cursor.is_empty() {
            // sentinel: pagination previously completed
            return Ok(Page {
                events: Vec::new(),
                has_more: false,
            });
        }

        let fetched = tokio::select! {
            page = self.history.page_before(room_id, &cursor, limit) => {
                page.map_err(PaginateError::Source)?
            }
            _ = guard.token.cancelled() => return Err(guard.interrupt_error()),
            _ = cancel.cancelled() => return Err(PaginateError::Cancelled),
        };

        let has_more = fetched.end.is_some();
        let next_cursor = fetched.end.unwrap_or_default();
        let start_seq = self.store.reserve_prepend(fetched.events.len() as i64);

        let crypto = self.crypto.clone();
        let events = self.store.with_txn(|txn| {
            let mut stored = Vec::new();
            let mut seq = start_seq;
            for ev in &fetched.events {
                let (new_event, _) = build_timeline_event(crypto.as_ref(), txn, room_id, ev)?;
                let (rowid, outcome) = upsert_event(txn, &new_event)?;
                // defensive de-dup against retried requests
                if outcome != UpsertOutcome::Inserted && timeline::contains(txn, room_id, rowid)? {
                    continue;
                }
                if timeline::prepend(txn, room_id, rowid, seq)? {
                    seq -= 1;
                    if let Some(event) = harbor_store::events::get_by_rowid(txn, rowid)? {
                        stored.push(event);
                    }
                }
            }
            rooms::set_prev_batch(txn, room_id, Some(&next_cursor))?;
            Ok(stored)
        })?;

        if !has_more {
            info!("history complete for {}", room_id);
        }
        let page = Page { events, has_more };

        let push = PushEvent::HistoryLoaded {
            room_id: room_id.clone(),
            events: page.events.clone(),
            has_more,
        };
        if self.publish.send(push).await.is_err() {
            warn!("event pipeline closed, dropping pagination notice");
        }
        Ok(page)
    }
}
