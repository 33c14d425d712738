//! Collaborators shared by every coordinator.

use std::sync::Arc;

use roadsync_core::RoadDataSource;
use roadsync_core::store::{StoreError, VersionedStore, WriteBatch};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::CommitError;

/// Store, source, configuration and shutdown signal for one process.
pub struct SyncContext<S> {
    /// Replica store.
    pub store: Arc<S>,
    /// Upstream data source.
    pub source: Arc<dyn RoadDataSource>,
    /// Engine settings.
    pub config: Arc<SyncConfig>,
    /// Cancelled when the process should stop fetching.
    pub shutdown: CancellationToken,
}

impl<S> Clone for SyncContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            source: Arc::clone(&self.source),
            config: Arc::clone(&self.config),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: VersionedStore + 'static> SyncContext<S> {
    /// Assemble a context with a fresh shutdown token.
    pub fn new(store: Arc<S>, source: Arc<dyn RoadDataSource>, config: SyncConfig) -> Self {
        Self {
            store,
            source,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Share `shutdown` instead of the context's own token.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Commit `batch` on the blocking pool.
    ///
    /// The commit runs to completion even if the calling task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when the store rejects the batch or the
    /// blocking task fails.
    pub async fn commit(&self, batch: WriteBatch) -> Result<(), CommitError> {
        if batch.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.commit(batch)).await??;
        Ok(())
    }

    /// Build a batch against the store and commit it, both on the blocking
    /// pool. `build` returns the batch together with a value for the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when building or committing fails.
    pub(crate) async fn write<T, F>(&self, build: F) -> Result<T, CommitError>
    where
        F: FnOnce(&S) -> Result<(WriteBatch, T), StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let value = tokio::task::spawn_blocking(move || {
            let (batch, value) = build(&store)?;
            store.commit(batch)?;
            Ok::<_, StoreError>(value)
        })
        .await??;
        Ok(value)
    }
}
