//! The account's sync loop: pull one batch, apply it, publish the
//! change-set, back off on failure. Syncs are never processed concurrently
//! with each other, so the batch cursor has a single writer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harbor_crypto::RetryQueue;
use harbor_store::Store;
use harbor_types::{PushEvent, SyncPayload, SyncStatus};

use crate::processor::Processor;

/// The pull-driven incremental sync source.
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Returns the next batch after `since`. Blocks (long-polls) until the
    /// server has something or a timeout elapses.
    async fn next_batch(&self, since: Option<&str>) -> anyhow::Result<SyncPayload>;
}

/// Consecutive failures after which the status degrades to failed.
const MAX_FAILURES: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

fn backoff(failures: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1u32 << (failures.saturating_sub(1)).min(6))
        .min(BACKOFF_CAP)
}

pub struct SyncLoop {
    store: Arc<Store>,
    processor: Processor,
    source: Arc<dyn SyncSource>,
    retry: Arc<RetryQueue>,
    publish: mpsc::Sender<PushEvent>,
    status: watch::Sender<SyncStatus>,
}

impl SyncLoop {
    pub fn new(
        store: Arc<Store>,
        processor: Processor,
        source: Arc<dyn SyncSource>,
        retry: Arc<RetryQueue>,
        publish: mpsc::Sender<PushEvent>,
    ) -> (Self, watch::Receiver<SyncStatus>) {
        let (status, status_rx) = watch::channel(SyncStatus::Ok);
        (
            Self {
                store,
                processor,
                source,
                retry,
                publish,
                status,
            },
            status_rx,
        )
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("sync loop running");
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            let since = match self.store.account() {
                Ok(Some(account)) => account.next_batch,
                Ok(None) => {
                    warn!("no account configured, sync loop idle");
                    if !self.sleep(Duration::from_secs(5), &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("cannot read account: {e}");
                    break;
                }
            };

            let payload = tokio::select! {
                result = self.source.next_batch(since.as_deref()) => result,
                _ = cancel.cancelled() => break,
            };

            let applied = match payload {
                Ok(payload) => self.apply(payload).await,
                Err(e) => Err(format!("sync request failed: {e:#}")),
            };

            match applied {
                Ok(()) => {
                    failures = 0;
                    self.set_status(SyncStatus::Ok).await;
                }
                Err(message) => {
                    failures += 1;
                    let delay = backoff(failures);
                    warn!("sync batch failed ({failures} in a row): {message}");
                    let status = if failures >= MAX_FAILURES {
                        SyncStatus::Failed { message }
                    } else {
                        SyncStatus::Erroring {
                            message,
                            retry_in_ms: delay.as_millis() as u64,
                        }
                    };
                    self.set_status(status).await;
                    if !self.sleep(delay, &cancel).await {
                        break;
                    }
                }
            }
        }
        info!("sync loop stopped");
    }

    /// Applies one payload and publishes what it produced. Returns a
    /// human-readable failure message on error so the same batch can be
    /// retried against an unmoved cursor.
    async fn apply(&self, payload: SyncPayload) -> Result<(), String> {
        let outcome = self
            .processor
            .process(&payload)
            .map_err(|e| format!("{e:#}"))?;

        for export in &outcome.sessions {
            if let Err(e) = self.retry.session_received(export).await {
                warn!("pushed session {} not applied: {e:#}", export.session_id);
            }
        }

        if !outcome.changes.is_empty() {
            debug!(
                "sync batch applied: {} room changes",
                outcome.changes.rooms.len()
            );
            self.forward(PushEvent::SyncComplete {
                changes: outcome.changes,
            })
            .await;
        }
        for event in outcome.ephemeral {
            self.forward(event).await;
        }
        Ok(())
    }

    async fn forward(&self, event: PushEvent) {
        if self.publish.send(event).await.is_err() {
            warn!("event pipeline closed, dropping sync output");
        }
    }

    async fn set_status(&self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            self.forward(PushEvent::SyncStatus {
                status: self.status.borrow().clone(),
            })
            .await;
        }
    }

    /// Returns false when cancelled during the sleep.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(10), Duration::from_secs(60));
    }
}
