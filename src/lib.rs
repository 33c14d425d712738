//! Facade crate for the roadsync engine.
//!
//! This crate re-exports the domain types from `roadsync-core` and the
//! coordinators from `roadsync-data`. The SQLite store is available behind
//! the `store-sqlite` feature.

#![forbid(unsafe_code)]

pub use roadsync_core::{
    ChangeBatch, ChangeKind, ChangeLedger, Classification, EntityStream, ExportError,
    FeatureChange, FeatureExporter, FeatureRules, LinkGeometryEncoder, LocationEncoder, ObjectKey,
    RoadDataSource, RoadLinkSequence, RoadObject, SourceError, TypeId,
};

pub use roadsync_core::store::{MemoryStore, StoreError, VersionedStore, WriteBatch};

#[cfg(feature = "store-sqlite")]
pub use roadsync_core::store::SqliteStore;

pub use roadsync_data::{
    BackfillCoordinator, BackfillReport, ExportCycle, ExportReport, HttpRoadSource, RetryPolicy,
    RetryingSource, SyncConfig, SyncContext, SyncState, UpdateCoordinator, UpdateReport,
};
