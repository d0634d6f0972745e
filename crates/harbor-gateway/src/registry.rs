//! Registry of in-flight gateway requests: a lock-guarded map from
//! (connection, request id) to a cancellation token. Registration on
//! start, deregistration on every exit path via the guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<(Uuid, i64), CancellationToken>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and hands back its guard. Returns `None` when
    /// the same request id is already in flight on this connection.
    pub fn register(self: &Arc<Self>, conn: Uuid, request_id: i64) -> Option<RequestGuard> {
        let mut inner = self.inner.lock().expect("request registry poisoned");
        if inner.contains_key(&(conn, request_id)) {
            return None;
        }
        let token = CancellationToken::new();
        inner.insert((conn, request_id), token.clone());
        Some(RequestGuard {
            registry: self.clone(),
            conn,
            request_id,
            token,
        })
    }

    /// Trips the token of one named request. Returns whether it was found.
    pub fn cancel(&self, conn: Uuid, request_id: i64) -> bool {
        let inner = self.inner.lock().expect("request registry poisoned");
        match inner.get(&(conn, request_id)) {
            Some(token) => {
                token.cancel();
                debug!("cancelled request {request_id} on {conn}");
                true
            }
            None => false,
        }
    }

    /// Trips every request owned by one connection. Called on teardown so
    /// orphaned handlers stop promptly.
    pub fn cancel_all(&self, conn: Uuid) {
        let inner = self.inner.lock().expect("request registry poisoned");
        for ((owner, _), token) in inner.iter() {
            if *owner == conn {
                token.cancel();
            }
        }
    }

    fn deregister(&self, conn: Uuid, request_id: i64) {
        self.inner
            .lock()
            .expect("request registry poisoned")
            .remove(&(conn, request_id));
    }
}

/// Live registration of one request. Dropping it deregisters, whatever the
/// exit path was.
pub struct RequestGuard {
    registry: Arc<RequestRegistry>,
    conn: Uuid,
    request_id: i64,
    token: CancellationToken,
}

impl RequestGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.conn, self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_request_id_is_rejected_until_the_guard_drops() {
        let registry = Arc::new(RequestRegistry::new());
        let conn = Uuid::new_v4();

        let guard = registry.register(conn, 7).unwrap();
        assert!(registry.register(conn, 7).is_none());
        // same id on another connection is independent
        assert!(registry.register(Uuid::new_v4(), 7).is_some());

        drop(guard);
        assert!(registry.register(conn, 7).is_some());
    }

    #[test]
    fn cancel_trips_exactly_the_named_request() {
        let registry = Arc::new(RequestRegistry::new());
        let conn = Uuid::new_v4();
        let a = registry.register(conn, 1).unwrap();
        let b = registry.register(conn, 2).unwrap();

        assert!(registry.cancel(conn, 1));
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert!(!registry.cancel(conn, 99));
    }

    #[test]
    fn teardown_cancels_only_that_connections_requests() {
        let registry = Arc::new(RequestRegistry::new());
        let conn = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mine = registry.register(conn, 1).unwrap();
        let theirs = registry.register(other, 1).unwrap();

        registry.cancel_all(conn);
        assert!(mine.token().is_cancelled());
        assert!(!theirs.token().is_cancelled());
    }
}
