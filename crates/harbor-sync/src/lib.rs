//! The sync engine: applies incremental-sync payloads to the durable
//! mirror inside one transaction each, maintains the space hierarchy,
//! serves history pagination, and runs the account's sync loop.

pub mod heroes;
pub mod merge;
pub mod ops;
pub mod paginate;
pub mod processor;
pub mod run;
pub mod spaces;
pub mod unread;

pub use merge::{RoomProposal, merge};
pub use ops::{ClientOps, OpsError};
pub use paginate::{HistoryPage, HistorySource, PaginateError, PaginationRegistry, Paginator};
pub use processor::{ProcessOutcome, Processor};
pub use run::{SyncLoop, SyncSource};

use harbor_store::StoreError;

/// Errors that abort a sync batch. The whole transaction rolls back and the
/// loop retries the same batch.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no account configured")]
    NoAccount,

    #[error("sync source error: {0}")]
    Source(#[source] anyhow::Error),
}
