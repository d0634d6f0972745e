//! Capability traits the engine is wired with. Network-facing ones are
//! async; the provider itself is synchronous in-process key handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use harbor_types::{EventRowId, RoomId, SessionId, UserId};

use crate::DecryptError;

/// A decrypted payload: the inner event type and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decrypted {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

/// An exportable group session, as stored in key backup or shared between
/// devices. `first_index` is the lowest ratchet index the key can decrypt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedSession {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub key: String,
    pub first_index: u32,
}

/// In-process group-encryption operations.
pub trait CryptoProvider: Send + Sync {
    /// Decrypts an encrypted event's content.
    fn decrypt(&self, room_id: &RoomId, content: &Value) -> Result<Decrypted, DecryptError>;

    /// Encrypts an outgoing event, rotating in a fresh outbound session if
    /// none is cached for the room.
    fn encrypt(&self, room_id: &RoomId, kind: &str, content: &Value) -> anyhow::Result<Value>;

    /// Drops the cached outbound session, forcing a rotation on next send.
    /// Called when a membership change plausibly invalidates it.
    fn discard_outbound_session(&self, room_id: &RoomId);

    /// Imports a session received from backup, a device share, or a sync
    /// push. Returns false when an equal-or-better copy is already held.
    fn import_session(&self, export: &ExportedSession) -> bool;

    /// The lowest ratchet index the held copy of a session can decrypt.
    fn first_known_index(&self, room_id: &RoomId, session_id: &SessionId) -> Option<u32>;

    /// Sessions not yet uploaded to key backup.
    fn sessions_pending_backup(&self) -> Vec<ExportedSession>;

    fn mark_backed_up(&self, session_ids: &[SessionId]);
}

/// Remote key backup.
#[async_trait]
pub trait KeyBackup: Send + Sync {
    async fn fetch_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> anyhow::Result<Option<ExportedSession>>;

    async fn upload_sessions(&self, sessions: &[ExportedSession]) -> anyhow::Result<()>;
}

/// Peer-device tracking and session requests.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Users whose device lists changed since last checked.
    async fn stale_users(&self) -> anyhow::Result<Vec<UserId>>;

    async fn refresh_user(&self, user: &UserId) -> anyhow::Result<()>;

    /// Asks the sender's other devices for a session.
    async fn request_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
        from: &UserId,
    ) -> anyhow::Result<()>;
}

/// Outbound delivery of locally-originated events to the federated network.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// Sends the event; the confirmed protocol id arrives later via the
    /// sync echo and collapses into the pending row by txn id.
    async fn send(
        &self,
        room_id: &RoomId,
        txn_id: &str,
        kind: &str,
        content: &Value,
    ) -> anyhow::Result<()>;
}

/// Sink for media references discovered while processing events.
/// Thumbnailing and transcoding happen entirely behind this seam.
pub trait MediaSink: Send + Sync {
    fn put(&self, locator: &str, metadata: &Value);
    fn add_reference(&self, event: EventRowId, locator: &str);
}

/// No-op media sink for wiring without a media backend.
#[derive(Debug, Default)]
pub struct NullMediaSink;

impl MediaSink for NullMediaSink {
    fn put(&self, _locator: &str, _metadata: &Value) {}
    fn add_reference(&self, _event: EventRowId, _locator: &str) {}
}
