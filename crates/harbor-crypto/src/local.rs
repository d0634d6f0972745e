//! In-process group-session provider built on AES-256-GCM.
//!
//! Sessions are per-room symmetric keys with a monotonically increasing
//! message index. A held key can decrypt messages from its `first_index`
//! onward; earlier indices need a better copy of the session (backup or a
//! peer device share).

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use harbor_types::{RoomId, SessionId};

use crate::provider::{CryptoProvider, Decrypted, ExportedSession};
use crate::DecryptError;

pub const ALGORITHM: &str = "aegis.v1";

struct InboundSession {
    key: [u8; 32],
    first_index: u32,
}

struct OutboundSession {
    session_id: SessionId,
    key: [u8; 32],
    next_index: u32,
    backed_up: bool,
}

/// Provider state. All maps are lock-guarded; locks are held only for map
/// access, never across I/O.
#[derive(Default)]
pub struct LocalCrypto {
    inbound: Mutex<HashMap<(RoomId, SessionId), InboundSession>>,
    outbound: Mutex<HashMap<RoomId, OutboundSession>>,
    withheld: Mutex<HashMap<(RoomId, SessionId), String>>,
}

impl LocalCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a peer declined to share a session. Decrypt attempts
    /// for it fail with the withheld reason until a copy arrives anyway.
    pub fn withhold(&self, room_id: &RoomId, session_id: &SessionId, reason: &str) {
        self.withheld
            .lock()
            .expect("withheld lock poisoned")
            .insert((room_id.clone(), session_id.clone()), reason.to_string());
    }

    fn session_fingerprint(key: &[u8; 32]) -> SessionId {
        let digest = Sha256::digest(key);
        SessionId(hex::encode(&digest[..16]))
    }
}

fn field<'v>(content: &'v Value, name: &str) -> Result<&'v str, DecryptError> {
    content
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| DecryptError::Malformed(format!("missing {name}")))
}

impl CryptoProvider for LocalCrypto {
    fn decrypt(&self, room_id: &RoomId, content: &Value) -> Result<Decrypted, DecryptError> {
        let algorithm = field(content, "algorithm")?;
        if algorithm != ALGORITHM {
            return Err(DecryptError::Malformed(format!(
                "unknown algorithm {algorithm}"
            )));
        }
        let session_id = SessionId(field(content, "session_id")?.to_string());
        let index = content
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| DecryptError::Malformed("missing index".into()))? as u32;

        let inbound = self.inbound.lock().expect("inbound lock poisoned");
        let session = match inbound.get(&(room_id.clone(), session_id.clone())) {
            Some(session) => session,
            None => {
                let withheld = self.withheld.lock().expect("withheld lock poisoned");
                if let Some(reason) = withheld.get(&(room_id.clone(), session_id.clone())) {
                    return Err(DecryptError::Withheld {
                        session_id,
                        reason: reason.clone(),
                    });
                }
                return Err(DecryptError::NoSession { session_id, index });
            }
        };
        if index < session.first_index {
            return Err(DecryptError::UnknownIndex { session_id, index });
        }

        let ciphertext = BASE64
            .decode(field(content, "ciphertext")?)
            .map_err(|e| DecryptError::Malformed(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(field(content, "nonce")?)
            .map_err(|e| DecryptError::Malformed(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(DecryptError::Malformed("bad nonce length".into()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| DecryptError::Malformed("authentication failed".into()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| DecryptError::Malformed(format!("bad plaintext: {e}")))
    }

    fn encrypt(&self, room_id: &RoomId, kind: &str, content: &Value) -> anyhow::Result<Value> {
        let mut outbound = self.outbound.lock().expect("outbound lock poisoned");
        let session = outbound.entry(room_id.clone()).or_insert_with(|| {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            let session_id = Self::session_fingerprint(&key);
            debug!("rotated outbound session {} for {}", session_id, room_id);
            OutboundSession {
                session_id,
                key,
                next_index: 0,
                backed_up: false,
            }
        });
        let index = session.next_index;
        session.next_index += 1;

        let plaintext = serde_json::to_vec(&Decrypted {
            kind: kind.to_string(),
            content: content.clone(),
        })?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        // own messages must decrypt locally as well
        let session_id = session.session_id.clone();
        let key = session.key;
        drop(outbound);
        self.inbound
            .lock()
            .expect("inbound lock poisoned")
            .entry((room_id.clone(), session_id.clone()))
            .or_insert(InboundSession {
                key,
                first_index: 0,
            });

        Ok(serde_json::json!({
            "algorithm": ALGORITHM,
            "session_id": session_id.0,
            "index": index,
            "ciphertext": BASE64.encode(&ciphertext),
            "nonce": BASE64.encode(nonce_bytes),
        }))
    }

    fn discard_outbound_session(&self, room_id: &RoomId) {
        if self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .remove(room_id)
            .is_some()
        {
            debug!("discarded outbound session for {}", room_id);
        }
    }

    fn import_session(&self, export: &ExportedSession) -> bool {
        let key: [u8; 32] = match BASE64.decode(&export.key).ok().and_then(|k| k.try_into().ok()) {
            Some(key) => key,
            None => return false,
        };
        let mut inbound = self.inbound.lock().expect("inbound lock poisoned");
        let slot = (export.room_id.clone(), export.session_id.clone());
        match inbound.get(&slot) {
            // an equal-or-better copy is already held
            Some(existing) if existing.first_index <= export.first_index => false,
            _ => {
                inbound.insert(
                    slot,
                    InboundSession {
                        key,
                        first_index: export.first_index,
                    },
                );
                true
            }
        }
    }

    fn first_known_index(&self, room_id: &RoomId, session_id: &SessionId) -> Option<u32> {
        self.inbound
            .lock()
            .expect("inbound lock poisoned")
            .get(&(room_id.clone(), session_id.clone()))
            .map(|s| s.first_index)
    }

    fn sessions_pending_backup(&self) -> Vec<ExportedSession> {
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .iter()
            .filter(|(_, s)| !s.backed_up)
            .map(|(room_id, s)| ExportedSession {
                room_id: room_id.clone(),
                session_id: s.session_id.clone(),
                key: BASE64.encode(s.key),
                first_index: 0,
            })
            .collect()
    }

    fn mark_backed_up(&self, session_ids: &[SessionId]) {
        let mut outbound = self.outbound.lock().expect("outbound lock poisoned");
        for session in outbound.values_mut() {
            if session_ids.contains(&session.session_id) {
                session.backed_up = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::from("!r:x")
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let crypto = LocalCrypto::new();
        let body = serde_json::json!({"body": "hello"});
        let encrypted = crypto.encrypt(&room(), "room.message", &body).unwrap();
        assert_eq!(encrypted["algorithm"], ALGORITHM);

        let decrypted = crypto.decrypt(&room(), &encrypted).unwrap();
        assert_eq!(decrypted.kind, "room.message");
        assert_eq!(decrypted.content, body);
    }

    #[test]
    fn missing_session_is_retryable() {
        let sender = LocalCrypto::new();
        let receiver = LocalCrypto::new();
        let encrypted = sender
            .encrypt(&room(), "room.message", &serde_json::json!({"body": "x"}))
            .unwrap();

        let err = receiver.decrypt(&room(), &encrypted).unwrap_err();
        assert!(matches!(err, DecryptError::NoSession { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn imported_session_respects_first_index() {
        let sender = LocalCrypto::new();
        let receiver = LocalCrypto::new();
        let first = sender
            .encrypt(&room(), "room.message", &serde_json::json!({"i": 0}))
            .unwrap();
        let second = sender
            .encrypt(&room(), "room.message", &serde_json::json!({"i": 1}))
            .unwrap();

        // share the session as if exported at index 1
        let mut export = sender.sessions_pending_backup().remove(0);
        export.first_index = 1;
        assert!(receiver.import_session(&export));

        let err = receiver.decrypt(&room(), &first).unwrap_err();
        assert!(matches!(err, DecryptError::UnknownIndex { .. }));
        assert!(receiver.decrypt(&room(), &second).is_ok());

        // a better copy (index 0) supersedes; an equal one does not
        export.first_index = 0;
        assert!(receiver.import_session(&export));
        assert!(receiver.decrypt(&room(), &first).is_ok());
        assert!(!receiver.import_session(&export));
    }

    #[test]
    fn discard_rotates_outbound_session() {
        let crypto = LocalCrypto::new();
        let a = crypto
            .encrypt(&room(), "room.message", &serde_json::json!({}))
            .unwrap();
        crypto.discard_outbound_session(&room());
        let b = crypto
            .encrypt(&room(), "room.message", &serde_json::json!({}))
            .unwrap();
        assert_ne!(a["session_id"], b["session_id"]);
    }

    #[test]
    fn withheld_session_reports_reason() {
        let crypto = LocalCrypto::new();
        let other = LocalCrypto::new();
        let encrypted = other
            .encrypt(&room(), "room.message", &serde_json::json!({}))
            .unwrap();
        let session_id = SessionId(encrypted["session_id"].as_str().unwrap().to_string());

        crypto.withhold(&room(), &session_id, "unverified device");
        let err = crypto.decrypt(&room(), &encrypted).unwrap_err();
        assert!(matches!(err, DecryptError::Withheld { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn backup_flush_tracks_state() {
        let crypto = LocalCrypto::new();
        crypto
            .encrypt(&room(), "room.message", &serde_json::json!({}))
            .unwrap();
        let pending = crypto.sessions_pending_backup();
        assert_eq!(pending.len(), 1);

        crypto.mark_backed_up(&[pending[0].session_id.clone()]);
        assert!(crypto.sessions_pending_backup().is_empty());
    }
}
