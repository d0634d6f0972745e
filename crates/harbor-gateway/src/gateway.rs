//! Shared gateway state: the run identity every connection checks its
//! resume cursor against, the resumable buffer, the request registry, and
//! the pump feeding the buffer from the engine's publish channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use harbor_store::Store;
use harbor_types::{PushEvent, SyncStatus};

use crate::buffer::EventBuffer;
use crate::commands::CommandHost;
use crate::registry::RequestRegistry;

/// Bumped whenever the meaning of buffered frames changes; a client
/// resuming across versions gets a full snapshot instead.
pub const CONTENT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retained-entry cap of the resumable buffer.
    pub buffer_cap: usize,
    /// Per-connection outbound queue length. A connection that cannot
    /// drain this many frames is force-closed.
    pub outbound_queue: usize,
    /// Keepalive tick; two silent intervals close the connection.
    pub keepalive: Duration,
    /// Rooms per page of the initial snapshot.
    pub snapshot_page: u32,
    /// Lifetime of the image-access token re-sent on each keepalive.
    pub image_token_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer_cap: 4096,
            outbound_queue: 256,
            keepalive: Duration::from_secs(15),
            snapshot_page: 50,
            image_token_ttl: Duration::from_secs(300),
        }
    }
}

/// Cheap-to-clone handle shared by every connection.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    run_id: String,
    store: Arc<Store>,
    buffer: Arc<EventBuffer>,
    commands: CommandHost,
    requests: Arc<RequestRegistry>,
    status: watch::Receiver<SyncStatus>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        store: Arc<Store>,
        commands: CommandHost,
        status: watch::Receiver<SyncStatus>,
        config: GatewayConfig,
    ) -> Self {
        let run_id = Uuid::new_v4().to_string();
        info!("gateway run {run_id}");
        Self {
            inner: Arc::new(GatewayInner {
                run_id,
                store,
                buffer: Arc::new(EventBuffer::new(config.buffer_cap)),
                commands,
                requests: Arc::new(RequestRegistry::new()),
                status,
                config,
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.inner.buffer
    }

    pub fn commands(&self) -> &CommandHost {
        &self.inner.commands
    }

    pub fn requests(&self) -> &Arc<RequestRegistry> {
        &self.inner.requests
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// First frame of every connection.
    pub fn run_marker(&self) -> PushEvent {
        PushEvent::RunId {
            run_id: self.inner.run_id.clone(),
            content_version: CONTENT_VERSION,
        }
    }

    /// The account identity frame, when an account is configured.
    pub fn client_state(&self) -> Option<PushEvent> {
        let account = self.inner.store.account().ok().flatten()?;
        Some(PushEvent::ClientState {
            user_id: account.user_id,
            device_id: account.device_id,
        })
    }

    /// A fresh short-lived token front ends attach to media requests.
    pub fn image_token(&self) -> PushEvent {
        PushEvent::ImageToken {
            token: Uuid::new_v4().simple().to_string(),
            expires_in_ms: self.inner.config.image_token_ttl.as_millis() as u64,
        }
    }

    /// Drains the engine's publish channel into the buffer until the
    /// channel closes or the token trips.
    pub async fn pump(self, mut events: mpsc::Receiver<PushEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.inner.buffer.publish(event);
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("event pump stopped");
    }
}
