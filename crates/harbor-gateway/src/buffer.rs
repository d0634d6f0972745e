//! The resumable outbound buffer: a bounded ring of change events, each
//! stamped with a strictly decreasing 64-bit id at insertion. Subscribers
//! replay from an acknowledged cursor and then receive the live stream.
//!
//! Ids count down from -1, so a cursor of 0 means "nothing received yet"
//! and every pushed frame's id fits the wire rule that server-initiated
//! frames carry negative or zero request ids.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use harbor_types::PushEvent;

/// One buffered event. The assigned id doubles as the synthetic request id
/// of the pushed frame.
#[derive(Debug, Clone)]
pub struct Buffered {
    pub id: i64,
    pub event: Arc<PushEvent>,
}

pub type SubscriberId = u64;

/// The cursor points past the retained window (or at an id that was never
/// assigned); the client must restart from a full snapshot.
#[derive(Debug, thiserror::Error)]
#[error("cursor {cursor} is not resumable")]
pub struct NotResumable {
    pub cursor: i64,
}

struct Subscriber {
    /// Last id this subscriber acknowledged; 0 before the first ack.
    cursor: i64,
    /// Live delivery channel. `None` after a clean disconnect: the ack
    /// requirement stays until the cursor falls off the buffer.
    tx: Option<mpsc::Sender<Buffered>>,
}

struct Inner {
    /// Retained cacheable events, oldest (largest id) at the front.
    entries: VecDeque<Buffered>,
    /// Next id to assign.
    next_id: i64,
    /// Newest id ever dropped from retention. Cursors newer than it can no
    /// longer be replayed in full.
    floor: Option<i64>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_subscriber: SubscriberId,
}

/// The ring buffer. One lock, held only for pointer manipulation.
pub struct EventBuffer {
    inner: Mutex<Inner>,
    cap: usize,
}

impl EventBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: -1,
                floor: None,
                subscribers: HashMap::new(),
                next_subscriber: 1,
            }),
            cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("event buffer lock poisoned")
    }

    /// Assigns the next id, delivers to every live subscriber, and retains
    /// the event when it is cacheable. A subscriber whose queue is full is
    /// dropped outright rather than backpressuring the pipeline.
    pub fn publish(&self, event: PushEvent) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id -= 1;
        let buffered = Buffered {
            id,
            event: Arc::new(event),
        };

        let mut dead = Vec::new();
        for (&sub, state) in inner.subscribers.iter() {
            let Some(tx) = &state.tx else { continue };
            match tx.try_send(buffered.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscriber {sub} cannot drain, dropping it");
                    dead.push(sub);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(sub),
            }
        }
        for sub in dead {
            inner.subscribers.remove(&sub);
        }

        if buffered.event.cacheable() {
            inner.entries.push_back(buffered);
            while inner.entries.len() > self.cap {
                Self::drop_oldest(&mut inner);
            }
        }
        id
    }

    /// Removes the oldest retained entry and advances the low-water mark
    /// past it. Detached subscribers stranded behind the mark are pruned.
    fn drop_oldest(inner: &mut Inner) {
        let Some(evicted) = inner.entries.pop_front() else {
            return;
        };
        trace!("evicting buffered event {}", evicted.id);
        inner.floor = Some(evicted.id);
        inner
            .subscribers
            .retain(|_, s| s.tx.is_some() || s.cursor <= evicted.id);
    }

    /// Trims entries already acknowledged by every subscriber. With no
    /// subscribers at all nothing is trimmed; the cap still bounds memory.
    fn gc(inner: &mut Inner) {
        let Some(needed) = inner.subscribers.values().map(|s| s.cursor).max() else {
            return;
        };
        while inner.entries.front().is_some_and(|e| e.id >= needed) {
            Self::drop_oldest(inner);
        }
    }

    /// Registers a subscriber resuming from `cursor` (its highest
    /// acknowledged id, 0 for none). Returns the replay of every retained
    /// event newer than the cursor; live events follow on `tx`.
    pub fn subscribe(
        &self,
        cursor: i64,
        tx: mpsc::Sender<Buffered>,
    ) -> Result<(SubscriberId, Vec<Buffered>), NotResumable> {
        let mut inner = self.lock();
        if cursor > 0 || cursor <= inner.next_id {
            return Err(NotResumable { cursor });
        }
        if inner.floor.is_some_and(|floor| cursor > floor) {
            return Err(NotResumable { cursor });
        }

        let replay: Vec<Buffered> = inner
            .entries
            .iter()
            .filter(|e| e.id < cursor)
            .cloned()
            .collect();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                cursor,
                tx: Some(tx),
            },
        );
        debug!("subscriber {id} resumed at {cursor}, {} replayed", replay.len());
        Ok((id, replay))
    }

    /// Registers a subscriber at the current head, with no replay. Used
    /// when the client restarts from a full snapshot.
    pub fn subscribe_live(&self, tx: mpsc::Sender<Buffered>) -> SubscriberId {
        let mut inner = self.lock();
        let cursor = inner.next_id + 1;
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                cursor,
                tx: Some(tx),
            },
        );
        id
    }

    /// Records that `sub` has received everything down to `upto`.
    pub fn ack(&self, sub: SubscriberId, upto: i64) {
        let mut inner = self.lock();
        let Some(state) = inner.subscribers.get_mut(&sub) else {
            return;
        };
        if upto < state.cursor {
            state.cursor = upto;
        }
        Self::gc(&mut inner);
    }

    /// Clean disconnect: stops live delivery but keeps the ack requirement,
    /// so the cursor stays replayable until it falls off the buffer.
    pub fn detach(&self, sub: SubscriberId) {
        if let Some(state) = self.lock().subscribers.get_mut(&sub) {
            state.tx = None;
        }
    }

    /// Abnormal disconnect: removes the subscriber and its requirement.
    pub fn clear(&self, sub: SubscriberId) {
        let mut inner = self.lock();
        inner.subscribers.remove(&sub);
        Self::gc(&mut inner);
    }

    /// Number of retained entries, for introspection.
    pub fn retained(&self) -> usize {
        self.lock().entries.len()
    }
}
