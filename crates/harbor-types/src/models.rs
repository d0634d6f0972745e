use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::{EventId, EventRowId, RoomId, SessionId, UserId};

/// How trustworthy a room's derived name is. Higher tiers are never
/// overwritten by lower ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum NameQuality {
    #[default]
    Nil,
    /// Derived from the lazy-load heroes list.
    Heroes,
    /// Derived from the canonical alias.
    CanonicalAlias,
    /// Set explicitly by a name state event.
    Explicit,
}

/// Lazy-load member summary: a few representative members plus counts,
/// enough to derive a display name without the full member list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoomSummary {
    pub heroes: Vec<UserId>,
    pub joined: u64,
    pub invited: u64,
}

/// A room as mirrored in the local store.
///
/// Mutated only by the sync processor and the pagination loader, via the
/// copy-on-write merge in `harbor-sync`, never field-by-field in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub create_content: Option<Value>,
    pub tombstone_content: Option<Value>,
    pub name: Option<String>,
    pub name_quality: NameQuality,
    pub avatar_url: Option<String>,
    /// True when the avatar came from an avatar state event rather than a
    /// DM peer's profile.
    pub avatar_explicit: bool,
    pub dm_user_id: Option<UserId>,
    pub topic: Option<String>,
    pub summary: RoomSummary,
    /// Encryption algorithm. Sticky: once set it is never cleared or
    /// replaced by a different value.
    pub encryption: Option<String>,
    pub has_member_list: bool,
    pub preview_event: Option<EventRowId>,
    /// Monotonic ordering timestamp (ms). Bumped by preview-eligible events.
    pub sorting_timestamp: i64,
    pub unread_highlights: i64,
    pub unread_notifications: i64,
    pub unread_messages: i64,
    pub marked_unread: bool,
    /// Opaque backward-pagination cursor. `Some("")` marks history complete.
    pub prev_batch: Option<String>,
}

impl Room {
    pub fn empty(id: RoomId) -> Self {
        Self {
            id,
            create_content: None,
            tombstone_content: None,
            name: None,
            name_quality: NameQuality::Nil,
            avatar_url: None,
            avatar_explicit: false,
            dm_user_id: None,
            topic: None,
            summary: RoomSummary::default(),
            encryption: None,
            has_member_list: false,
            preview_event: None,
            sorting_timestamp: 0,
            unread_highlights: 0,
            unread_notifications: 0,
            unread_messages: 0,
            marked_unread: false,
            prev_batch: None,
        }
    }

    /// A usable display name exists (anything above the nil tier).
    pub fn has_name(&self) -> bool {
        self.name_quality > NameQuality::Nil
    }
}

/// Unread classification assigned by push-rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnreadFlags {
    pub highlight: bool,
    pub notify: bool,
    pub sound: bool,
    /// Counts toward the room's unread-messages total even when no rule
    /// asked to notify.
    pub message: bool,
}

impl UnreadFlags {
    pub fn any(&self) -> bool {
        self.highlight || self.notify || self.sound || self.message
    }
}

/// The kind of relation an event declares toward another event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// An edit replacing the target's content.
    Replace,
    /// A reaction attached to the target.
    Annotation,
    /// A reply quoting the target.
    Reply,
}

/// An event row as mirrored in the local store.
///
/// The content is append-once; decrypted/edit/redaction/reaction fields are
/// updated in place as later events reference this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub rowid: EventRowId,
    pub id: EventId,
    pub txn_id: Option<String>,
    pub room_id: RoomId,
    pub sender: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub state_key: Option<String>,
    pub origin_ts: i64,
    pub content: Value,
    pub decrypted: Option<Value>,
    pub decrypted_kind: Option<String>,
    pub decryption_error: Option<String>,
    pub redacted_by: Option<EventId>,
    pub relates_to: Option<EventId>,
    pub relation_kind: Option<RelationKind>,
    /// Reaction-count cache, keyed by reaction key.
    pub reactions: BTreeMap<String, i64>,
    pub last_edit: Option<EventRowId>,
    pub unread: UnreadFlags,
}

impl Event {
    /// The effective type: decrypted type when available, wire type otherwise.
    pub fn effective_kind(&self) -> &str {
        self.decrypted_kind.as_deref().unwrap_or(&self.kind)
    }

    /// The effective content: decrypted payload when available.
    pub fn effective_content(&self) -> &Value {
        self.decrypted.as_ref().unwrap_or(&self.content)
    }

    pub fn is_redacted(&self) -> bool {
        self.redacted_by.is_some()
    }

    /// Whether this event may serve as a room's preview: a visible (or
    /// successfully decrypted) message or sticker that is neither an edit
    /// nor redacted.
    pub fn preview_eligible(&self) -> bool {
        if self.is_redacted() || matches!(self.relation_kind, Some(RelationKind::Replace)) {
            return false;
        }
        if self.kind == crate::kinds::ENCRYPTED && self.decrypted.is_none() {
            return false;
        }
        matches!(
            self.effective_kind(),
            crate::kinds::MESSAGE | crate::kinds::STICKER
        )
    }
}

/// Read-receipt kinds the engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Read,
    ReadPrivate,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::ReadPrivate => "read_private",
        }
    }
}

/// Latest-wins receipt for one (room, user, kind, thread) slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub kind: ReceiptKind,
    pub thread: Option<String>,
    pub event_id: EventId,
    pub ts: i64,
}

/// One parent/child edge in the space hierarchy.
///
/// The child half comes from the parent's `space.child` state; the parent
/// half from the child's `space.parent` state. A row with neither half is
/// pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceEdge {
    pub space_id: RoomId,
    pub child_id: RoomId,
    pub child_event: Option<EventRowId>,
    pub ordering: Option<String>,
    pub suggested: bool,
    pub parent_event: Option<EventRowId>,
    pub canonical: bool,
    /// True once the claimed parent's power over the child checked out.
    pub parent_validated: bool,
}

impl SpaceEdge {
    pub fn is_empty(&self) -> bool {
        self.child_event.is_none() && self.parent_event.is_none()
    }
}

/// Queue entry for a missing group-encryption session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub sender: UserId,
    /// Lowest ratchet index any queued ciphertext needs.
    pub min_index: u32,
    pub backup_checked: bool,
    pub request_sent: bool,
}

/// The single local account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub device_id: String,
    pub access_token: String,
    pub next_batch: Option<String>,
}

/// Sync-loop health, published as an immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Ok,
    Erroring {
        message: String,
        retry_in_ms: u64,
    },
    Failed {
        message: String,
    },
}
