//! Errors raised by the coordinators.

use roadsync_core::store::StoreError;
use roadsync_core::{ExportError, EntityStream, SourceError};
use thiserror::Error;

use crate::config::ConfigError;

/// A batch commit failed.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The store rejected the batch; nothing was applied.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The blocking commit task panicked or was cancelled.
    #[error("commit task did not complete")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors aborting a backfill run.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A fetch failed permanently or ran out of retries.
    #[error("failed to fetch {stream} partition {partition}")]
    Fetch {
        /// Stream being fetched.
        stream: EntityStream,
        /// Partition index.
        partition: u32,
        /// Source failure.
        #[source]
        source: SourceError,
    },
    /// Seeding the event cursors failed.
    #[error("failed to seed event cursor of {stream}")]
    SeedCursor {
        /// Stream being seeded.
        stream: EntityStream,
        /// Source failure.
        #[source]
        source: SourceError,
    },
    /// The source returned a cursor that does not advance.
    #[error("{stream} partition {partition} returned a non-advancing cursor {cursor}")]
    StalledCursor {
        /// Stream being fetched.
        stream: EntityStream,
        /// Partition index.
        partition: u32,
        /// Repeated cursor.
        cursor: u64,
    },
    /// A resumed run uses a different partition count than the one recorded.
    #[error("backfill was started with {recorded} partitions but {configured} are configured")]
    PartitionMismatch {
        /// Partition count stored with the run.
        recorded: u32,
        /// Partition count in the configuration.
        configured: u32,
    },
    /// Reading bookkeeping failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Committing a chunk failed.
    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Errors aborting an update run.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A fetch failed permanently or ran out of retries.
    #[error("failed to poll {stream}")]
    Fetch {
        /// Stream being polled.
        stream: EntityStream,
        /// Source failure.
        #[source]
        source: SourceError,
    },
    /// Reading replica state failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Committing a page failed.
    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Errors aborting an export cycle. The ledger is left untouched.
#[derive(Debug, Error)]
pub enum ExportCycleError {
    /// Draining the ledger failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The exporter did not accept the batch.
    #[error(transparent)]
    Export(#[from] ExportError),
    /// Committing bookkeeping failed after the export.
    #[error(transparent)]
    Commit(#[from] CommitError),
}
