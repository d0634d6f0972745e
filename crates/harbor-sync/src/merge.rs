//! The copy-on-write room merge: the processor builds a proposal holding
//! only what this batch learned, and the pure merge decides per field
//! whether the proposal beats the stored value. Keeping this side-effect
//! free lets concurrent derivations (name from state vs. name from heroes)
//! compose without clobbering each other.

use serde_json::Value;

use harbor_types::{EventRowId, NameQuality, Room, RoomSummary, UserId};

/// Proposed room changes from one sync batch. `None` means "no opinion".
#[derive(Debug, Clone, Default)]
pub struct RoomProposal {
    pub create_content: Option<Value>,
    pub tombstone_content: Option<Value>,
    /// Name with its quality tier; wins only at equal or higher quality.
    pub name: Option<(String, NameQuality)>,
    /// Avatar URL plus whether it was set explicitly by state.
    pub avatar: Option<(String, bool)>,
    pub dm_user_id: Option<UserId>,
    pub topic: Option<String>,
    pub summary: Option<RoomSummary>,
    /// Encryption algorithm; sticky, never replaces an existing value.
    pub encryption: Option<String>,
    pub has_member_list: Option<bool>,
    pub preview_event: Option<EventRowId>,
    /// Monotonic; wins only when strictly newer.
    pub sorting_timestamp: Option<i64>,
    /// (highlights, notifications, messages)
    pub unread: Option<(i64, i64, i64)>,
    pub marked_unread: Option<bool>,
    pub prev_batch: Option<String>,
}

impl RoomProposal {
    pub fn is_empty(&self) -> bool {
        self.create_content.is_none()
            && self.tombstone_content.is_none()
            && self.name.is_none()
            && self.avatar.is_none()
            && self.dm_user_id.is_none()
            && self.topic.is_none()
            && self.summary.is_none()
            && self.encryption.is_none()
            && self.has_member_list.is_none()
            && self.preview_event.is_none()
            && self.sorting_timestamp.is_none()
            && self.unread.is_none()
            && self.marked_unread.is_none()
            && self.prev_batch.is_none()
    }

    /// Proposes a name, keeping only the best-quality proposal seen so far
    /// within this batch.
    pub fn propose_name(&mut self, name: String, quality: NameQuality) {
        if name.is_empty() {
            return;
        }
        match &self.name {
            Some((_, held)) if *held > quality => {}
            _ => self.name = Some((name, quality)),
        }
    }
}

/// Merges a proposal into the stored room. Returns the merged record and
/// whether anything actually changed.
pub fn merge(proposal: &RoomProposal, stored: &Room) -> (Room, bool) {
    let mut merged = stored.clone();

    if let Some(create) = &proposal.create_content {
        merged.create_content = Some(create.clone());
    }
    if let Some(tombstone) = &proposal.tombstone_content {
        merged.tombstone_content = Some(tombstone.clone());
    }
    if let Some((name, quality)) = &proposal.name {
        // equal quality replaces: full-state syncs re-send the same event
        if *quality >= stored.name_quality {
            merged.name = Some(name.clone());
            merged.name_quality = *quality;
        }
    }
    if let Some((url, explicit)) = &proposal.avatar {
        // an explicit avatar is never overwritten by a derived one
        if *explicit || !stored.avatar_explicit {
            merged.avatar_url = Some(url.clone());
            merged.avatar_explicit = *explicit;
        }
    }
    if let Some(dm) = &proposal.dm_user_id {
        merged.dm_user_id = Some(dm.clone());
    }
    if let Some(topic) = &proposal.topic {
        merged.topic = Some(topic.clone());
    }
    if let Some(summary) = &proposal.summary {
        merged.summary = summary.clone();
    }
    if let Some(algorithm) = &proposal.encryption {
        // sticky: never downgraded or replaced once set
        if stored.encryption.is_none() {
            merged.encryption = Some(algorithm.clone());
        }
    }
    if let Some(has) = proposal.has_member_list {
        merged.has_member_list = merged.has_member_list || has;
    }
    if let Some(preview) = proposal.preview_event {
        merged.preview_event = Some(preview);
    }
    if let Some(ts) = proposal.sorting_timestamp {
        if ts > stored.sorting_timestamp {
            merged.sorting_timestamp = ts;
        }
    }
    if let Some((highlights, notifications, messages)) = proposal.unread {
        merged.unread_highlights = highlights;
        merged.unread_notifications = notifications;
        merged.unread_messages = messages;
    }
    if let Some(marked) = proposal.marked_unread {
        merged.marked_unread = marked;
    }
    if let Some(prev_batch) = &proposal.prev_batch {
        merged.prev_batch = Some(prev_batch.clone());
    }

    let changed = merged != *stored;
    (merged, changed)
}
