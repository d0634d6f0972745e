//! Shapes of the incremental-sync payload handed to the engine by the
//! external sync source. One payload per call; the engine applies it in a
//! single store transaction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, RoomId, UserId};
use crate::models::ReceiptKind;

/// One incremental-sync batch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncPayload {
    /// Cursor to hand back to the source for the next batch.
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Vec<RoomUpdate>,
    /// Rooms the local user has left; their local mirror is dropped.
    #[serde(default)]
    pub left_rooms: Vec<RoomId>,
    #[serde(default)]
    pub account_data: Vec<AccountDataEvent>,
    #[serde(default)]
    pub to_device: Vec<ToDeviceEvent>,
}

/// Per-room slice of a sync batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub room_id: RoomId,
    /// True when the state list is a complete snapshot rather than a delta.
    #[serde(default)]
    pub full_state: bool,
    #[serde(default)]
    pub state: Vec<PduEvent>,
    #[serde(default)]
    pub timeline: Vec<PduEvent>,
    /// True when the server skipped history between the last batch and this
    /// timeline slice: the local timeline cache is no longer contiguous.
    #[serde(default)]
    pub limited: bool,
    /// Continuation token for backward pagination at the gap.
    pub prev_batch: Option<String>,
    #[serde(default)]
    pub ephemeral: Vec<EphemeralSignal>,
    pub summary: Option<SummaryDelta>,
}

impl RoomUpdate {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            full_state: false,
            state: Vec::new(),
            timeline: Vec::new(),
            limited: false,
            prev_batch: None,
            ephemeral: Vec::new(),
            summary: None,
        }
    }
}

/// A wire event as delivered by the sync source or by pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PduEvent {
    pub event_id: EventId,
    pub sender: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub state_key: Option<String>,
    pub origin_ts: i64,
    pub content: Value,
    /// Echo of the local transaction id for events this device sent.
    pub txn_id: Option<String>,
}

/// Ephemeral, non-persistent signals attached to a room update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum EphemeralSignal {
    Typing { user_ids: Vec<UserId> },
    Receipts { receipts: Vec<ReceiptEntry> },
}

/// One receipt inside an ephemeral receipts signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEntry {
    pub user_id: UserId,
    pub kind: ReceiptKind,
    pub thread: Option<String>,
    pub event_id: EventId,
    pub ts: i64,
}

/// Account-wide data delta (push rules, DM map, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDataEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

/// Device-targeted message (session shares, key requests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    pub sender: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

/// Lazy-load summary delta; only changed fields are present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SummaryDelta {
    pub heroes: Option<Vec<UserId>>,
    pub joined: Option<u64>,
    pub invited: Option<u64>,
}

impl SummaryDelta {
    pub fn is_empty(&self) -> bool {
        self.heroes.is_none() && self.joined.is_none() && self.invited.is_none()
    }
}
