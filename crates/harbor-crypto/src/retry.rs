//! The decryption-retry queue: a background loop that refreshes stale
//! device lists, flushes sessions to key backup, and chases missing group
//! sessions, first through backup and then by asking peer devices.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harbor_store::{Store, events, rooms, sessions};
use harbor_types::{Event, PushEvent, RoomId, SessionRequest};

use crate::provider::{CryptoProvider, DeviceDirectory, ExportedSession, KeyBackup};
use crate::DecryptError;

/// How many pending session requests one iteration processes concurrently.
const REQUEST_BATCH: u32 = 5;

pub struct RetryQueue {
    store: Arc<Store>,
    crypto: Arc<dyn CryptoProvider>,
    backup: Arc<dyn KeyBackup>,
    devices: Arc<dyn DeviceDirectory>,
    publish: mpsc::Sender<PushEvent>,
    wake: Arc<Notify>,
}

impl RetryQueue {
    pub fn new(
        store: Arc<Store>,
        crypto: Arc<dyn CryptoProvider>,
        backup: Arc<dyn KeyBackup>,
        devices: Arc<dyn DeviceDirectory>,
        publish: mpsc::Sender<PushEvent>,
    ) -> Self {
        Self {
            store,
            crypto,
            backup,
            devices,
            publish,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle used to wake the loop after a new decryption failure or a
    /// device-list change.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// The queue loop. Runs until cancelled; blocks on the wake-up signal
    /// whenever an iteration found nothing to do.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("decryption retry queue running");
        loop {
            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!("retry queue iteration failed: {e:#}");
                    false
                }
            };
            if cancel.is_cancelled() {
                break;
            }
            if !worked {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        info!("decryption retry queue stopped");
    }

    /// One iteration: device refresh, backup flush, then a bounded batch of
    /// session requests. Returns whether any work was done.
    pub async fn run_once(&self) -> anyhow::Result<bool> {
        let mut worked = false;

        let stale = self.devices.stale_users().await?;
        for user in &stale {
            self.devices.refresh_user(user).await?;
            worked = true;
        }

        let unbacked = self.crypto.sessions_pending_backup();
        if !unbacked.is_empty() {
            self.backup.upload_sessions(&unbacked).await?;
            let ids: Vec<_> = unbacked.iter().map(|s| s.session_id.clone()).collect();
            self.crypto.mark_backed_up(&ids);
            debug!("uploaded {} sessions to backup", ids.len());
            worked = true;
        }

        let pending = self
            .store
            .with_conn(|conn| sessions::pending_requests(conn, REQUEST_BATCH))?;
        if !pending.is_empty() {
            let results = join_all(pending.into_iter().map(|req| self.process_request(req))).await;
            for result in results {
                match result {
                    Ok(()) => worked = true,
                    Err(e) => warn!("session request failed: {e:#}"),
                }
            }
        }

        Ok(worked)
    }

    async fn process_request(&self, req: SessionRequest) -> anyhow::Result<()> {
        if !req.backup_checked {
            match self.backup.fetch_session(&req.room_id, &req.session_id).await? {
                Some(export) => {
                    self.session_received(&export).await?;
                }
                None => {
                    self.store.with_conn(|conn| {
                        sessions::mark_backup_checked(conn, &req.room_id, &req.session_id)
                    })?;
                }
            }
        } else {
            self.devices
                .request_session(&req.room_id, &req.session_id, &req.sender)
                .await?;
            self.store.with_conn(|conn| {
                sessions::mark_request_sent(conn, &req.room_id, &req.session_id)
            })?;
            debug!(
                "requested session {} in {} from {}",
                req.session_id, req.room_id, req.sender
            );
        }
        Ok(())
    }

    /// A session became available (from backup, a device share, or a sync
    /// push): re-decrypts every stored failure its index range covers and
    /// publishes the result.
    pub async fn session_received(&self, export: &ExportedSession) -> anyhow::Result<()> {
        self.crypto.import_session(export);

        let crypto = self.crypto.clone();
        let room_id = export.room_id.clone();
        let (decrypted, preview_changed) = self.store.with_txn(|txn| {
            let eligible = events::failed_events_for_session(
                txn,
                &export.room_id,
                &export.session_id,
                export.first_index,
            )?;

            let mut decrypted: Vec<Event> = Vec::new();
            for event in eligible {
                match crypto.decrypt(&event.room_id, &event.content) {
                    Ok(plain) => {
                        events::set_decrypted(txn, event.rowid, &plain.content, &plain.kind)?;
                        if let Some(updated) = events::get_by_rowid(txn, event.rowid)? {
                            decrypted.push(updated);
                        }
                    }
                    Err(e) if e.is_retryable() => {}
                    Err(e) => {
                        events::set_decrypt_failed(txn, event.rowid, &e.to_string(), false)?;
                    }
                }
            }

            // the request row is satisfied once the stored requirement is covered
            if let Some(req) =
                sessions::get_request(txn, &export.room_id, &export.session_id)?
            {
                if export.first_index <= req.min_index {
                    sessions::remove_request(txn, &export.room_id, &export.session_id)?;
                } else {
                    sessions::mark_backup_checked(txn, &export.room_id, &export.session_id)?;
                }
            }

            let preview_changed = update_preview(txn, &room_id, &decrypted)?;
            Ok((decrypted, preview_changed))
        })?;

        if decrypted.is_empty() {
            return Ok(());
        }
        info!(
            "session {} decrypted {} queued events in {}",
            export.session_id,
            decrypted.len(),
            export.room_id
        );
        let push = PushEvent::EventsDecrypted {
            room_id: export.room_id.clone(),
            events: decrypted,
            preview_changed,
        };
        if self.publish.send(push).await.is_err() {
            warn!("event pipeline closed, dropping decryption notice");
        }
        Ok(())
    }
}

/// Points the room preview at the newest freshly-decrypted eligible event,
/// when it is newer than the current preview.
fn update_preview(
    conn: &rusqlite::Connection,
    room_id: &RoomId,
    decrypted: &[Event],
) -> harbor_store::Result<bool> {
    let newest = decrypted
        .iter()
        .filter(|e| e.preview_eligible())
        .max_by_key(|e| e.origin_ts);
    let Some(newest) = newest else {
        return Ok(false);
    };
    let Some(mut room) = rooms::get_room(conn, room_id)? else {
        return Ok(false);
    };

    let current_ts = match room.preview_event {
        Some(rowid) => events::get_by_rowid(conn, rowid)?
            .map(|e| e.origin_ts)
            .unwrap_or(i64::MIN),
        None => i64::MIN,
    };
    if newest.origin_ts <= current_ts {
        return Ok(false);
    }

    room.preview_event = Some(newest.rowid);
    room.sorting_timestamp = room.sorting_timestamp.max(newest.origin_ts);
    rooms::save_room(conn, &room)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCrypto;
    use async_trait::async_trait;
    use harbor_store::events::{NewEvent, upsert_event};
    use harbor_store::timeline;
    use harbor_types::{EventId, Room, SessionId, UserId};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackup {
        sessions: Mutex<Vec<ExportedSession>>,
        uploads: Mutex<Vec<ExportedSession>>,
    }

    #[async_trait]
    impl KeyBackup for FakeBackup {
        async fn fetch_session(
            &self,
            room_id: &RoomId,
            session_id: &SessionId,
        ) -> anyhow::Result<Option<ExportedSession>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .find(|s| &s.room_id == room_id && &s.session_id == session_id)
                .cloned())
        }

        async fn upload_sessions(&self, sessions: &[ExportedSession]) -> anyhow::Result<()> {
            self.uploads.lock().unwrap().extend_from_slice(sessions);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDevices {
        requested: Mutex<Vec<SessionId>>,
    }

    #[async_trait]
    impl DeviceDirectory for FakeDevices {
        async fn stale_users(&self) -> anyhow::Result<Vec<UserId>> {
            Ok(Vec::new())
        }

        async fn refresh_user(&self, _user: &UserId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn request_session(
            &self,
            _room_id: &RoomId,
            session_id: &SessionId,
            _from: &UserId,
        ) -> anyhow::Result<()> {
            self.requested.lock().unwrap().push(session_id.clone());
            Ok(())
        }
    }

    fn room_id() -> RoomId {
        RoomId::from("!r:x")
    }

    /// Stores an encrypted event as a retryable decryption failure, the way
    /// the sync processor would.
    fn store_failed(store: &Store, id: &str, content: &Value, ts: i64) {
        let session_id = SessionId(content["session_id"].as_str().unwrap().to_string());
        let index = content["index"].as_u64().unwrap() as u32;
        store
            .with_conn(|conn| {
                let mut ev = NewEvent::plain(
                    EventId::from(id),
                    room_id(),
                    UserId::from("@peer:x"),
                    "room.encrypted",
                    ts,
                    content.clone(),
                );
                ev.session_id = Some(session_id.clone());
                ev.message_index = Some(index);
                ev.decryption_error = Some("no session".into());
                ev.decrypt_retryable = true;
                let (rowid, _) = upsert_event(conn, &ev)?;
                timeline::append(conn, &room_id(), rowid)?;
                sessions::queue_request(
                    conn,
                    &room_id(),
                    &session_id,
                    &UserId::from("@peer:x"),
                    index,
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn queue(
        store: Arc<Store>,
        crypto: Arc<dyn CryptoProvider>,
        backup: Arc<FakeBackup>,
        devices: Arc<FakeDevices>,
    ) -> (RetryQueue, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            RetryQueue::new(store, crypto, backup, devices, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn session_arrival_decrypts_covered_events_only() {
        let sender = LocalCrypto::new();
        let e0 = sender
            .encrypt(&room_id(), "room.message", &serde_json::json!({"body": "0"}))
            .unwrap();
        let e1 = sender
            .encrypt(&room_id(), "room.message", &serde_json::json!({"body": "1"}))
            .unwrap();
        let e2 = sender
            .encrypt(&room_id(), "room.message", &serde_json::json!({"body": "2"}))
            .unwrap();

        let store = Arc::new(Store::in_memory().unwrap());
        store
            .with_conn(|conn| rooms::save_room(conn, &Room::empty(room_id())))
            .unwrap();
        store_failed(&store, "$e0", &e0, 10);
        store_failed(&store, "$e1", &e1, 20);
        store_failed(&store, "$e2", &e2, 30);

        let receiver = Arc::new(LocalCrypto::new());
        let (queue, mut rx) = queue(
            store.clone(),
            receiver,
            Arc::new(FakeBackup::default()),
            Arc::new(FakeDevices::default()),
        );

        // session exported from index 1: event 0 must stay failed
        let mut export = sender.sessions_pending_backup().remove(0);
        export.first_index = 1;
        queue.session_received(&export).await.unwrap();

        let ev0 = store.get_event(&EventId::from("$e0")).unwrap().unwrap();
        assert!(ev0.decrypted.is_none());
        let ev1 = store.get_event(&EventId::from("$e1")).unwrap().unwrap();
        assert_eq!(ev1.decrypted.as_ref().unwrap()["body"], "1");
        let ev2 = store.get_event(&EventId::from("$e2")).unwrap().unwrap();
        assert_eq!(ev2.decrypted.as_ref().unwrap()["body"], "2");

        match rx.try_recv().unwrap() {
            PushEvent::EventsDecrypted {
                events,
                preview_changed,
                ..
            } => {
                assert_eq!(events.len(), 2);
                assert!(preview_changed);
            }
            other => panic!("unexpected push: {other:?}"),
        }

        // preview points at the newest decrypted event
        let room = store.get_room(&room_id()).unwrap().unwrap();
        assert_eq!(room.preview_event, Some(ev2.rowid));
        assert_eq!(room.sorting_timestamp, 30);
    }

    #[tokio::test]
    async fn backup_miss_falls_through_to_device_request() {
        let sender = LocalCrypto::new();
        let encrypted = sender
            .encrypt(&room_id(), "room.message", &serde_json::json!({"body": "x"}))
            .unwrap();

        let store = Arc::new(Store::in_memory().unwrap());
        store
            .with_conn(|conn| rooms::save_room(conn, &Room::empty(room_id())))
            .unwrap();
        store_failed(&store, "$e", &encrypted, 10);

        let devices = Arc::new(FakeDevices::default());
        let (queue, _rx) = queue(
            store.clone(),
            Arc::new(LocalCrypto::new()),
            Arc::new(FakeBackup::default()),
            devices.clone(),
        );

        // first pass: backup checked, nothing found
        assert!(queue.run_once().await.unwrap());
        // second pass: request from devices
        assert!(queue.run_once().await.unwrap());
        assert_eq!(devices.requested.lock().unwrap().len(), 1);
        // third pass: request sent, nothing left to do
        assert!(!queue.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn backup_hit_satisfies_request() {
        let sender = LocalCrypto::new();
        let encrypted = sender
            .encrypt(&room_id(), "room.message", &serde_json::json!({"body": "x"}))
            .unwrap();

        let store = Arc::new(Store::in_memory().unwrap());
        store
            .with_conn(|conn| rooms::save_room(conn, &Room::empty(room_id())))
            .unwrap();
        store_failed(&store, "$e", &encrypted, 10);

        let backup = Arc::new(FakeBackup::default());
        backup
            .sessions
            .lock()
            .unwrap()
            .push(sender.sessions_pending_backup().remove(0));

        let (queue, _rx) = queue(
            store.clone(),
            Arc::new(LocalCrypto::new()),
            backup,
            Arc::new(FakeDevices::default()),
        );
        assert!(queue.run_once().await.unwrap());

        let ev = store.get_event(&EventId::from("$e")).unwrap().unwrap();
        assert_eq!(ev.decrypted.as_ref().unwrap()["body"], "x");
        assert!(store.pending_session_requests(5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_backup_flush_uploads_once() {
        let crypto = Arc::new(LocalCrypto::new());
        crypto
            .encrypt(&room_id(), "room.message", &serde_json::json!({}))
            .unwrap();

        let backup = Arc::new(FakeBackup::default());
        let (queue, _rx) = queue(
            Arc::new(Store::in_memory().unwrap()),
            crypto,
            backup.clone(),
            Arc::new(FakeDevices::default()),
        );

        assert!(queue.run_once().await.unwrap());
        assert_eq!(backup.uploads.lock().unwrap().len(), 1);
        assert!(!queue.run_once().await.unwrap());
    }
}

