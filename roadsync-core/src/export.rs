//! Hand-off of change batches to the downstream exporter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feature::{Classification, FeatureChange};

/// Changes produced by one export cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Time the cycle started.
    pub generated_at: DateTime<Utc>,
    /// Changes in type and id order.
    pub changes: Vec<FeatureChange>,
}

impl ChangeBatch {
    /// Number of changes with `classification`.
    #[must_use]
    pub fn count(&self, classification: Classification) -> usize {
        self.changes
            .iter()
            .filter(|change| change.classification == classification)
            .count()
    }
}

/// Errors reported by a [`FeatureExporter`].
#[derive(Debug, Error)]
pub enum ExportError {
    /// Writing the batch failed.
    #[error("failed to write change batch to {target}")]
    Io {
        /// Destination being written.
        target: String,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The batch could not be serialised.
    #[error("failed to serialise change batch")]
    Serialise(#[source] serde_json::Error),
    /// The exporter refused the batch.
    #[error("exporter rejected the batch: {message}")]
    Rejected {
        /// Explanation.
        message: String,
    },
}

/// Serialises and ships change batches.
///
/// Returning `Ok` means the batch has been durably handed off; the engine
/// clears the corresponding ledger entries afterwards.
#[async_trait]
pub trait FeatureExporter: Send + Sync {
    /// Export `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] when the batch was not handed off.
    async fn export(&self, batch: &ChangeBatch) -> Result<(), ExportError>;
}
