//! The sync processor: applies one incremental-sync payload inside a
//! single store transaction and produces the change-set the event buffer
//! republishes. Any error aborts the whole batch; the loop retries it.

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use harbor_crypto::{CryptoProvider, DecryptError, ExportedSession, MediaSink};
use harbor_store::events::{NewEvent, UpsertOutcome, upsert_event};
use harbor_store::spaces::{ChildHalf, ParentHalf};
use harbor_store::{Store, StoreError, account, events, receipts, rooms, state, timeline};
use harbor_types::push::PushRuleSet;
use harbor_types::{
    Account, ChangeSet, EphemeralSignal, Event, EventId, NameQuality, PduEvent, PushEvent,
    ReceiptKind, RelationKind, Room, RoomChange, RoomUpdate, SessionId, SyncPayload, UnreadFlags,
    kinds,
};

use crate::merge::{RoomProposal, merge};
use crate::paginate::{InterruptCause, PaginationRegistry};
use crate::spaces::SpaceDeltas;
use crate::unread::{EvalContext, classify};
use crate::{SyncError, heroes, spaces};

/// Everything one applied batch produced.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub changes: ChangeSet,
    /// Non-cacheable signals (typing) delivered live only.
    pub ephemeral: Vec<PushEvent>,
    /// Group sessions pushed via to-device messages; the caller hands them
    /// to the retry queue after the transaction commits.
    pub sessions: Vec<ExportedSession>,
    /// True when a new retryable decryption failure was queued.
    pub queued_decryption: bool,
}

pub struct Processor {
    store: Arc<Store>,
    crypto: Arc<dyn CryptoProvider>,
    media: Arc<dyn MediaSink>,
    decrypt_wake: Arc<Notify>,
    paginations: Arc<PaginationRegistry>,
}

/// How far back the boundary scan walks before giving up.
const BOUNDARY_SCAN_LIMIT: u32 = 200;

impl Processor {
    pub fn new(
        store: Arc<Store>,
        crypto: Arc<dyn CryptoProvider>,
        media: Arc<dyn MediaSink>,
        decrypt_wake: Arc<Notify>,
        paginations: Arc<PaginationRegistry>,
    ) -> Self {
        Self {
            store,
            crypto,
            media,
            decrypt_wake,
            paginations,
        }
    }

    /// Applies one payload transactionally. On success the decryption queue
    /// is woken for any newly queued failure and in-flight paginations of
    /// reset rooms are interrupted with the timeline-reset cause.
    pub fn process(&self, payload: &SyncPayload) -> Result<ProcessOutcome, SyncError> {
        let outcome = self.store.with_txn(|txn| self.apply(txn, payload))?;

        if outcome.queued_decryption {
            self.decrypt_wake.notify_one();
        }
        for change in &outcome.changes.rooms {
            if change.reset_timeline {
                self.paginations
                    .interrupt(&change.room.id, InterruptCause::TimelineReset);
            }
        }
        Ok(outcome)
    }

    fn apply(
        &self,
        conn: &Connection,
        payload: &SyncPayload,
    ) -> harbor_store::Result<ProcessOutcome> {
        let account = account::get_account(conn)?.ok_or(StoreError::NoAccount)?;
        let mut outcome = ProcessOutcome::default();

        // account data first: push rules may reclassify this very batch
        for data in &payload.account_data {
            account::put_account_data(conn, &data.kind, &data.content)?;
            outcome.changes.account_data.push(data.clone());
            if data.kind == kinds::ACCOUNT_DIRECT {
                apply_direct_map(conn, &data.content)?;
            }
        }
        let rules = load_push_rules(conn)?;

        let mut space_deltas = SpaceDeltas::default();
        for update in &payload.rooms {
            if let Some(change) = self.apply_room(
                conn,
                &account,
                &rules,
                &mut space_deltas,
                update,
                &mut outcome,
            )? {
                outcome.changes.rooms.push(change);
            }
        }

        spaces::apply(conn, &space_deltas)?;

        for left in &payload.left_rooms {
            if rooms::delete_room(conn, left)? {
                info!("left room {}", left);
            }
            self.crypto.discard_outbound_session(left);
            outcome.changes.left_rooms.push(left.clone());
        }

        for message in &payload.to_device {
            if message.kind == "encryption.session_share" {
                match serde_json::from_value::<ExportedSession>(message.content.clone()) {
                    Ok(export) => outcome.sessions.push(export),
                    Err(e) => warn!("malformed session share from {}: {e}", message.sender),
                }
            }
        }

        // the batch cursor moves only after everything above persisted
        account::set_next_batch(conn, &payload.next_batch)?;
        Ok(outcome)
    }

    fn apply_room(
        &self,
        conn: &Connection,
        account: &Account,
        rules: &PushRuleSet,
        space_deltas: &mut SpaceDeltas,
        update: &RoomUpdate,
        outcome: &mut ProcessOutcome,
    ) -> harbor_store::Result<Option<RoomChange>> {
        let existing = rooms::get_room(conn, &update.room_id)?;
        let is_new = existing.is_none();
        let stored = existing.unwrap_or_else(|| Room::empty(update.room_id.clone()));
        let mut proposal = RoomProposal::default();
        let mut change = RoomChange::new(stored.clone());

        if stored.prev_batch.is_none() {
            proposal.prev_batch = update.prev_batch.clone();
        }

        let mut summary_changed = false;
        if let Some(delta) = &update.summary {
            let mut summary = stored.summary.clone();
            if let Some(heroes) = &delta.heroes {
                summary.heroes = heroes.clone();
            }
            if let Some(joined) = delta.joined {
                summary.joined = joined;
            }
            if let Some(invited) = delta.invited {
                summary.invited = invited;
            }
            if summary != stored.summary {
                summary_changed = true;
                proposal.summary = Some(summary);
            }
        }

        for ev in &update.state {
            self.apply_state_event(conn, update, ev, &mut proposal, space_deltas, &mut change)?;
        }

        let mut redaction_removed_unread = false;
        let mut own_event_in_batch = false;
        let mut unread_delta = (0i64, 0i64, 0i64);
        for ev in &update.timeline {
            self.apply_timeline_event(
                conn,
                account,
                rules,
                &stored,
                update,
                ev,
                &mut proposal,
                space_deltas,
                &mut change,
                &mut redaction_removed_unread,
                &mut unread_delta,
                outcome,
            )?;
            if ev.sender == account.user_id {
                own_event_in_batch = true;
            }
        }

        // a gappy sync: the cached timeline is no longer contiguous
        if update.limited {
            timeline::clear(conn, &update.room_id)?;
            change.reset_timeline = true;
            if update.prev_batch.is_some() {
                proposal.prev_batch = update.prev_batch.clone();
            }
        }

        let mut own_receipt_arrived = false;
        for signal in &update.ephemeral {
            match signal {
                EphemeralSignal::Typing { user_ids } => {
                    outcome.ephemeral.push(PushEvent::Typing {
                        room_id: update.room_id.clone(),
                        user_ids: user_ids.clone(),
                    });
                }
                EphemeralSignal::Receipts { receipts: entries } => {
                    for entry in entries {
                        let receipt = harbor_types::Receipt {
                            room_id: update.room_id.clone(),
                            user_id: entry.user_id.clone(),
                            kind: entry.kind,
                            thread: entry.thread.clone(),
                            event_id: entry.event_id.clone(),
                            ts: entry.ts,
                        };
                        receipts::upsert_receipt(conn, &receipt)?;
                        if entry.user_id == account.user_id && entry.kind == ReceiptKind::Read {
                            own_receipt_arrived = true;
                        }
                        change.receipts.push(receipt);
                    }
                }
            }
        }

        // unread counters: recount from scratch whenever incremental
        // accounting could be wrong, per the safe-fallback policy
        let must_recount = own_receipt_arrived
            || own_event_in_batch
            || redaction_removed_unread
            || change.reset_timeline;
        if must_recount {
            let boundary = read_boundary(conn, &update.room_id, account)?;
            let (highlights, notifications, messages) =
                timeline::recount_unread(conn, &update.room_id, boundary)?;
            proposal.unread = Some((highlights, notifications, messages));
            if own_receipt_arrived {
                proposal.marked_unread = Some(false);
            }
        } else if unread_delta != (0, 0, 0) {
            proposal.unread = Some((
                stored.unread_highlights + unread_delta.0,
                stored.unread_notifications + unread_delta.1,
                stored.unread_messages + unread_delta.2,
            ));
        }

        // participant-derived naming, only when the inputs moved or no
        // usable name exists yet
        let (interim, _) = merge(&proposal, &stored);
        if summary_changed || !interim.has_name() {
            let summary = proposal.summary.as_ref().unwrap_or(&stored.summary);
            let memberships = hero_memberships(conn, update, &summary.heroes)?;
            if let Some(derived) = heroes::derive_name(
                &summary.heroes,
                &memberships,
                &account.user_id,
                summary.joined,
                summary.invited,
            ) {
                proposal.propose_name(derived.name, NameQuality::Heroes);
                if let Some(peer) = derived.dm_peer {
                    proposal.dm_user_id = Some(peer);
                }
            }
        }
        // last resort: the raw room id, so every room renders with something
        let (interim, _) = merge(&proposal, &stored);
        if interim.name.is_none() {
            proposal.propose_name(update.room_id.0.clone(), NameQuality::Nil);
        }

        let (merged, room_changed) = merge(&proposal, &stored);
        if room_changed || is_new {
            rooms::save_room(conn, &merged)?;
        }
        change.room = merged;

        let relevant = room_changed
            || is_new
            || change.reset_timeline
            || !change.events.is_empty()
            || !change.receipts.is_empty();
        Ok(relevant.then_some(change))
    }

    fn apply_state_event(
        &self,
        conn: &Connection,
        update: &RoomUpdate,
        ev: &PduEvent,
        proposal: &mut RoomProposal,
        space_deltas: &mut SpaceDeltas,
        change: &mut RoomChange,
    ) -> harbor_store::Result<()> {
        let Some(state_key) = ev.state_key.clone() else {
            warn!("state event {} without state key, skipping", ev.event_id);
            return Ok(());
        };

        let mut new_event = NewEvent::plain(
            ev.event_id.clone(),
            update.room_id.clone(),
            ev.sender.clone(),
            ev.kind.clone(),
            ev.origin_ts,
            ev.content.clone(),
        );
        new_event.txn_id = ev.txn_id.clone();
        new_event.state_key = Some(state_key.clone());
        let (rowid, _) = upsert_event(conn, &new_event)?;

        self.handle_important_state(conn, update, ev, &state_key, rowid, proposal, space_deltas)?;
        state::set_pointer(conn, &update.room_id, &ev.kind, &state_key, rowid)?;

        if let Some(event) = events::get_by_rowid(conn, rowid)? {
            change.push_event(event);
        }
        Ok(())
    }

    /// The fixed allow-list of state types that shape the room record and
    /// the space graph. Everything else only advances its state pointer.
    fn handle_important_state(
        &self,
        conn: &Connection,
        update: &RoomUpdate,
        ev: &PduEvent,
        state_key: &str,
        rowid: harbor_types::EventRowId,
        proposal: &mut RoomProposal,
        space_deltas: &mut SpaceDeltas,
    ) -> harbor_store::Result<()> {
        let content = &ev.content;
        match ev.kind.as_str() {
            kinds::CREATE => proposal.create_content = Some(content.clone()),
            kinds::TOMBSTONE => proposal.tombstone_content = Some(content.clone()),
            kinds::NAME => {
                if let Some(name) = content.get("name").and_then(Value::as_str) {
                    proposal.propose_name(name.to_string(), NameQuality::Explicit);
                }
            }
            kinds::CANONICAL_ALIAS => {
                if let Some(alias) = content.get("alias").and_then(Value::as_str) {
                    proposal.propose_name(alias.to_string(), NameQuality::CanonicalAlias);
                }
            }
            kinds::AVATAR => {
                if let Some(url) = content.get("url").and_then(Value::as_str) {
                    proposal.avatar = Some((url.to_string(), true));
                    self.media.put(url, content);
                }
            }
            kinds::TOPIC => {
                if let Some(topic) = content.get("topic").and_then(Value::as_str) {
                    proposal.topic = Some(topic.to_string());
                }
            }
            kinds::ENCRYPTION => {
                if let Some(algorithm) = content.get("algorithm").and_then(Value::as_str) {
                    proposal.encryption = Some(algorithm.to_string());
                }
            }
            kinds::POWER_LEVELS => space_deltas.mark_power_changed(&update.room_id),
            kinds::MEMBER => {
                self.handle_membership(conn, update, ev, state_key)?;
            }
            kinds::SPACE_CHILD => {
                let child = harbor_types::RoomId(state_key.to_string());
                if update.full_state {
                    space_deltas.mark_full_state(&update.room_id);
                }
                if content.get("via").is_some() {
                    space_deltas.add_child(
                        &update.room_id,
                        ChildHalf {
                            child_id: child,
                            child_event: rowid,
                            ordering: content
                                .get("order")
                                .and_then(Value::as_str)
                                .map(String::from),
                            suggested: content
                                .get("suggested")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        },
                    );
                } else {
                    space_deltas.remove_child(&update.room_id, &child);
                }
            }
            kinds::SPACE_PARENT => {
                let space = harbor_types::RoomId(state_key.to_string());
                if content.get("via").is_some() {
                    space_deltas.add_parent(
                        &update.room_id,
                        ParentHalf {
                            space_id: space,
                            parent_event: rowid,
                            canonical: content
                                .get("canonical")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        },
                    );
                } else {
                    space_deltas.remove_parent(&update.room_id, &space);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Membership transitions that plausibly invalidate the cached outbound
    /// session force a rotation on next send.
    fn handle_membership(
        &self,
        conn: &Connection,
        update: &RoomUpdate,
        ev: &PduEvent,
        state_key: &str,
    ) -> harbor_store::Result<()> {
        let old = state::get_state(conn, &update.room_id, kinds::MEMBER, state_key)?
            .and_then(|e| {
                e.content
                    .get("membership")
                    .and_then(Value::as_str)
                    .map(String::from)
            });
        let new = ev.content.get("membership").and_then(Value::as_str);

        let was_joined = old.as_deref() == Some(kinds::MEMBERSHIP_JOIN);
        match new {
            Some(kinds::MEMBERSHIP_LEAVE) | Some(kinds::MEMBERSHIP_BAN) if was_joined => {
                debug!("{} left {}, discarding outbound session", state_key, update.room_id);
                self.crypto.discard_outbound_session(&update.room_id);
            }
            Some(kinds::MEMBERSHIP_JOIN) if !was_joined => {
                let visibility = state::get_state(
                    conn,
                    &update.room_id,
                    kinds::HISTORY_VISIBILITY,
                    "",
                )?
                .and_then(|e| {
                    e.content
                        .get("history_visibility")
                        .and_then(Value::as_str)
                        .map(String::from)
                });
                let shared = matches!(
                    visibility.as_deref(),
                    Some("shared") | Some("world_readable")
                );
                if !shared {
                    debug!(
                        "{} joined {} without shared history, discarding outbound session",
                        state_key, update.room_id
                    );
                    self.crypto.discard_outbound_session(&update.room_id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_timeline_event(
        &self,
        conn: &Connection,
        account: &Account,
        rules: &PushRuleSet,
        stored: &Room,
        update: &RoomUpdate,
        ev: &PduEvent,
        proposal: &mut RoomProposal,
        space_deltas: &mut SpaceDeltas,
        change: &mut RoomChange,
        redaction_removed_unread: &mut bool,
        unread_delta: &mut (i64, i64, i64),
        outcome: &mut ProcessOutcome,
    ) -> harbor_store::Result<()> {
        let (mut new_event, queued) =
            build_timeline_event(self.crypto.as_ref(), conn, &update.room_id, ev)?;
        outcome.queued_decryption |= queued;

        let effective_kind = new_event.decrypted_kind.clone().unwrap_or(ev.kind.clone());
        let effective_content = new_event.decrypted.clone().unwrap_or(ev.content.clone());

        let summary = proposal.summary.as_ref().unwrap_or(&stored.summary);
        let member_count = summary.joined + summary.invited;
        new_event.unread = classify(
            rules,
            &EvalContext {
                own_user: &account.user_id,
                room_id: &update.room_id,
                member_count,
            },
            &ev.sender,
            &effective_kind,
            &effective_content,
        );

        let (rowid, upsert) = upsert_event(conn, &new_event)?;
        let appended = timeline::append(conn, &update.room_id, rowid)?;

        // only rows newly entering the timeline count; a re-delivered event
        // must not inflate the totals
        if appended.is_some() {
            if new_event.unread.highlight {
                unread_delta.0 += 1;
            }
            if new_event.unread.notify {
                unread_delta.1 += 1;
            }
            if new_event.unread.message {
                unread_delta.2 += 1;
            }
        }

        // state events riding the timeline still advance their slot
        if let Some(state_key) = &ev.state_key {
            self.handle_important_state(
                conn,
                update,
                ev,
                state_key,
                rowid,
                proposal,
                space_deltas,
            )?;
            state::set_pointer(conn, &update.room_id, &ev.kind, state_key, rowid)?;
        }

        if let Some(url) = effective_content.get("url").and_then(Value::as_str) {
            events::add_media_ref(conn, rowid, url)?;
            self.media.add_reference(rowid, url);
        }

        if ev.kind == kinds::REDACTION {
            self.apply_redaction(conn, ev, change, redaction_removed_unread)?;
        }
        self.apply_relation(conn, rowid, &new_event, &effective_content, change, upsert)?;

        if let Some(event) = events::get_by_rowid(conn, rowid)? {
            if event.preview_eligible()
                && ev.origin_ts >= proposal.sorting_timestamp.unwrap_or(stored.sorting_timestamp)
            {
                proposal.preview_event = Some(rowid);
                proposal.sorting_timestamp = Some(ev.origin_ts);
            }
            change.push_event(event);
        }
        Ok(())
    }

    /// A redaction pulls its target (and the target's own relation target)
    /// into the change-set so subscribers see the updated views.
    fn apply_redaction(
        &self,
        conn: &Connection,
        ev: &PduEvent,
        change: &mut RoomChange,
        redaction_removed_unread: &mut bool,
    ) -> harbor_store::Result<()> {
        let Some(target_id) = ev.content.get("redacts").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(target) = events::get_by_event_id(conn, &EventId(target_id.to_string()))? else {
            return Ok(());
        };

        if target.unread.any() {
            *redaction_removed_unread = true;
        }
        events::set_redacted(conn, target.rowid, &ev.event_id)?;

        // a redacted reaction or edit also changes the view of its target
        if let Some(grand_id) = &target.relates_to {
            if let Some(grand) = events::get_by_event_id(conn, grand_id)? {
                match target.relation_kind {
                    Some(RelationKind::Annotation) => {
                        if let Some(key) = reaction_key(&target) {
                            events::add_reaction(conn, grand.rowid, &key, -1)?;
                        }
                    }
                    Some(RelationKind::Replace) => {
                        // the edit no longer applies
                        if grand.last_edit == Some(target.rowid) {
                            events::clear_last_edit(conn, grand.rowid)?;
                        }
                    }
                    _ => {}
                }
                if let Some(updated) = events::get_by_rowid(conn, grand.rowid)? {
                    change.push_event(updated);
                }
            }
        }

        if let Some(updated) = events::get_by_rowid(conn, target.rowid)? {
            change.push_event(updated);
        }
        Ok(())
    }

    /// Edits, reactions and replies pull their target into the change-set;
    /// edits and reactions also update the target's caches.
    fn apply_relation(
        &self,
        conn: &Connection,
        rowid: harbor_types::EventRowId,
        new_event: &NewEvent,
        effective_content: &Value,
        change: &mut RoomChange,
        upsert: UpsertOutcome,
    ) -> harbor_store::Result<()> {
        let (Some(target_id), Some(kind)) = (&new_event.relates_to, new_event.relation_kind)
        else {
            return Ok(());
        };
        let Some(target) = events::get_by_event_id(conn, target_id)? else {
            return Ok(());
        };

        match kind {
            RelationKind::Replace => {
                if upsert == UpsertOutcome::Inserted && !target.is_redacted() {
                    events::set_last_edit(conn, target.rowid, rowid)?;
                }
            }
            RelationKind::Annotation => {
                if upsert == UpsertOutcome::Inserted && !target.is_redacted() {
                    if let Some(key) = effective_content
                        .get("relates_to")
                        .and_then(|r| r.get("key"))
                        .and_then(Value::as_str)
                    {
                        events::add_reaction(conn, target.rowid, key, 1)?;
                    }
                }
            }
            RelationKind::Reply => {}
        }

        if let Some(updated) = events::get_by_rowid(conn, target.rowid)? {
            change.push_event(updated);
        }
        Ok(())
    }
}

/// Builds the storable row for one wire timeline event: decrypts when the
/// session is available, queues a session request otherwise, and extracts
/// any relation. Shared by live sync and pagination.
pub(crate) fn build_timeline_event(
    crypto: &dyn CryptoProvider,
    conn: &Connection,
    room_id: &harbor_types::RoomId,
    ev: &PduEvent,
) -> harbor_store::Result<(NewEvent, bool)> {
    let mut new_event = NewEvent::plain(
        ev.event_id.clone(),
        room_id.clone(),
        ev.sender.clone(),
        ev.kind.clone(),
        ev.origin_ts,
        ev.content.clone(),
    );
    new_event.txn_id = ev.txn_id.clone();
    new_event.state_key = ev.state_key.clone();
    let mut queued = false;

    if ev.kind == kinds::ENCRYPTED {
        new_event.session_id = ev
            .content
            .get("session_id")
            .and_then(Value::as_str)
            .map(|s| SessionId(s.to_string()));
        new_event.message_index = ev
            .content
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as u32);

        match crypto.decrypt(room_id, &ev.content) {
            Ok(plain) => {
                new_event.decrypted = Some(plain.content);
                new_event.decrypted_kind = Some(plain.kind);
            }
            Err(err) => {
                new_event.decryption_error = Some(err.to_string());
                new_event.decrypt_retryable = err.is_retryable();
                if let DecryptError::NoSession { session_id, index }
                | DecryptError::UnknownIndex { session_id, index } = &err
                {
                    harbor_store::sessions::queue_request(
                        conn,
                        room_id,
                        session_id,
                        &ev.sender,
                        *index,
                    )?;
                    queued = true;
                } else if err.is_retryable() {
                    queued = true;
                }
            }
        }
    }

    let effective_content = new_event.decrypted.as_ref().unwrap_or(&ev.content);
    if let Some((target, kind)) = extract_relation(effective_content) {
        new_event.relates_to = Some(target);
        new_event.relation_kind = Some(kind);
    }
    Ok((new_event, queued))
}

/// Pulls the relation target out of an event's content:
/// `relates_to: {event_id, rel_type}` or `relates_to: {in_reply_to: {...}}`.
fn extract_relation(content: &Value) -> Option<(EventId, RelationKind)> {
    let relates = content.get("relates_to")?;
    if let Some(reply) = relates.get("in_reply_to") {
        let id = reply.get("event_id").and_then(Value::as_str)?;
        return Some((EventId(id.to_string()), RelationKind::Reply));
    }
    let id = relates.get("event_id").and_then(Value::as_str)?;
    let kind = match relates.get("rel_type").and_then(Value::as_str)? {
        "replace" => RelationKind::Replace,
        "annotation" => RelationKind::Annotation,
        _ => return None,
    };
    Some((EventId(id.to_string()), kind))
}

fn reaction_key(event: &Event) -> Option<String> {
    event
        .effective_content()
        .get("relates_to")
        .and_then(|r| r.get("key"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// The read-up-to boundary: the newest timeline event that is the local
/// user's own or the target of the local user's read receipt.
pub(crate) fn read_boundary(
    conn: &Connection,
    room_id: &harbor_types::RoomId,
    account: &Account,
) -> harbor_store::Result<Option<i64>> {
    let receipt_seq =
        match receipts::get_receipt(conn, room_id, &account.user_id, ReceiptKind::Read)? {
            Some(receipt) => timeline::seq_of(conn, room_id, &receipt.event_id)?,
            None => None,
        };

    let mut own_seq = None;
    for (seq, event) in timeline::page_before(conn, room_id, None, BOUNDARY_SCAN_LIMIT)? {
        if event.sender == account.user_id {
            own_seq = Some(seq);
            break;
        }
    }

    Ok(match (receipt_seq, own_seq) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    })
}

fn load_push_rules(conn: &Connection) -> harbor_store::Result<PushRuleSet> {
    match account::get_account_data(conn, kinds::ACCOUNT_PUSH_RULES)? {
        Some(content) => match serde_json::from_value(content) {
            Ok(rules) => Ok(rules),
            Err(e) => {
                warn!("stored push rules unreadable, using defaults: {e}");
                Ok(PushRuleSet::default())
            }
        },
        None => Ok(PushRuleSet::default()),
    }
}

/// The DM map assigns peer users to rooms wholesale.
fn apply_direct_map(conn: &Connection, content: &Value) -> harbor_store::Result<()> {
    let Some(map) = content.as_object() else {
        return Ok(());
    };
    for (user, rooms) in map {
        let Some(rooms) = rooms.as_array() else {
            continue;
        };
        for room in rooms.iter().filter_map(Value::as_str) {
            conn.execute(
                "UPDATE rooms SET dm_user_id = ?1 WHERE id = ?2",
                rusqlite::params![user, room],
            )?;
        }
    }
    Ok(())
}

/// Current memberships of the summary heroes, for name derivation.
fn hero_memberships(
    conn: &Connection,
    update: &RoomUpdate,
    heroes: &[harbor_types::UserId],
) -> harbor_store::Result<std::collections::HashMap<harbor_types::UserId, String>> {
    let mut memberships = std::collections::HashMap::new();
    for hero in heroes {
        if let Some(member) = state::get_state(conn, &update.room_id, kinds::MEMBER, &hero.0)? {
            if let Some(membership) = member
                .content
                .get("membership")
                .and_then(Value::as_str)
            {
                memberships.insert(hero.clone(), membership.to_string());
            }
        }
    }
    Ok(memberships)
}
