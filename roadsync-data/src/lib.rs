//! Orchestration and adapters for the roadsync engine.
//!
//! Responsibilities:
//! - Drive the partitioned backfill and the fixed-point update cycle.
//! - Run export cycles that hand change batches to a [`FeatureExporter`].
//! - Provide the HTTP source adapter and the network-layer retry wrapper.
//!
//! Boundaries:
//! - Domain rules, storage and diffing live in `roadsync-core`.
//! - Store reads and commits that touch many keys run on the blocking pool.
//!
//! Invariants:
//! - Every page is committed as one batch together with its checkpoint or
//!   cursor, so progress is never recorded ahead of the data it covers.
//! - Ledger entries are acknowledged only after the exporter accepted the
//!   batch that covers them.
//!
//! [`FeatureExporter`]: roadsync_core::FeatureExporter

mod apply;
pub mod backfill;
pub mod config;
pub mod context;
pub mod error;
pub mod export_cycle;
pub mod fs;
pub mod retry;
pub mod settings;
pub mod source;
pub mod update;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use backfill::{BackfillCoordinator, BackfillReport};
pub use config::{ConfigError, DEFAULT_ID_SPACE_END, SyncConfig};
pub use context::SyncContext;
pub use error::{BackfillError, CommitError, ExportCycleError, UpdateError};
pub use export_cycle::{ExportCycle, ExportReport};
pub use retry::{RetryPolicy, RetryingSource};
pub use source::{HttpRoadSource, HttpRoadSourceConfig, SourceBuildError};
pub use update::{SyncState, UpdateCoordinator, UpdateReport};
