//! Core domain types and storage for the roadsync engine.
//!
//! The crate holds the replicated road-network model, the namespaced
//! [`VersionedStore`](store::VersionedStore), the dirty-change ledger, the
//! exported-feature bookkeeping and the hash-based diff engine. Network
//! access and orchestration live in `roadsync-data`.

pub mod diff;
pub mod entities;
pub mod export;
pub mod exported;
pub mod feature;
pub mod hash;
pub mod ledger;
pub mod lookup;
mod model;
pub mod source;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use diff::{DiffReport, FeatureDiffEngine, SkippedFeature};
pub use export::{ChangeBatch, ExportError, FeatureExporter};
pub use exported::{ExportedFeature, ExportedFeatureStore, FeatureSummary};
pub use feature::{
    Classification, EncodeError, EncodedLocation, FeatureChange, FeatureContent, FeatureRules,
    LinkGeometryEncoder, LocationEncoder, RebuildError, rebuild_feature,
};
pub use hash::{ContentHash, HashError};
pub use ledger::{ChangeLedger, DirtyEntry, DirtyObjectChange, EntityKind, ObjectMarks};
pub use lookup::{EntityLookup, LookupError, StoreLookup};
pub use model::{
    ChangeKind, Direction, EntityStream, LinearLocation, ObjectKey, PropertyValue, RoadLink,
    RoadLinkSequence, RoadObject, TypeId, Validity,
};
pub use source::{
    Change, ChangeEvent, EntityPage, EventPage, IdRange, RoadDataSource, SourceError,
};
