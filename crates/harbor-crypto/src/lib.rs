//! The crypto capability seam and the asynchronous decryption-retry queue.
//!
//! The engine never implements the federated protocol's cryptography; it
//! talks to a [`CryptoProvider`] that can fail with "no session yet", and a
//! retry queue that chases missing sessions through key backup and peer
//! devices.

pub mod local;
pub mod provider;
pub mod retry;

pub use local::LocalCrypto;
pub use provider::{
    CryptoProvider, Decrypted, DeviceDirectory, EventSender, ExportedSession, KeyBackup,
    MediaSink, NullMediaSink,
};
pub use retry::RetryQueue;

use harbor_types::SessionId;

/// Why a decrypt attempt failed. Retryable kinds are queued for the retry
/// queue; terminal kinds are stored as a permanent per-event error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecryptError {
    #[error("no session {session_id}")]
    NoSession { session_id: SessionId, index: u32 },

    #[error("session {session_id} starts past index {index}")]
    UnknownIndex { session_id: SessionId, index: u32 },

    #[error("session {session_id} withheld: {reason}")]
    Withheld { session_id: SessionId, reason: String },

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

impl DecryptError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }

    /// The session this failure is waiting on, when there is one.
    pub fn session(&self) -> Option<(&SessionId, u32)> {
        match self {
            Self::NoSession { session_id, index }
            | Self::UnknownIndex { session_id, index } => Some((session_id, *index)),
            Self::Withheld { session_id, .. } => Some((session_id, 0)),
            Self::Malformed(_) => None,
        }
    }
}
