//! The closed registry of store namespaces.

use std::fmt;
use std::str::FromStr;

use super::StoreError;

/// An independently iterable and clearable keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// Link sequences keyed by sequence id.
    LinkSequences,
    /// Road objects keyed by type id and object id.
    RoadObjects,
    /// Sequence to object references keyed by sequence id, type id and object id.
    LocationIndex,
    /// Dirty link sequence ids with their discovery timestamp.
    DirtyLinkSequences,
    /// Dirty object changes keyed by type id and object id.
    DirtyObjects,
    /// Last exported hash and summary per feature.
    ExportedFeatures,
    /// Generic settings, including backfill checkpoints and event cursors.
    Settings,
}

impl Namespace {
    /// Every namespace the store must provide.
    pub const ALL: [Self; 7] = [
        Self::LinkSequences,
        Self::RoadObjects,
        Self::LocationIndex,
        Self::DirtyLinkSequences,
        Self::DirtyObjects,
        Self::ExportedFeatures,
        Self::Settings,
    ];

    /// Stable name used for on-disk tables.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LinkSequences => "link_sequences",
            Self::RoadObjects => "road_objects",
            Self::LocationIndex => "location_index",
            Self::DirtyLinkSequences => "dirty_link_sequences",
            Self::DirtyObjects => "dirty_objects",
            Self::ExportedFeatures => "exported_features",
            Self::Settings => "settings",
        }
    }

    /// Resolve a namespace from its stable name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.name() == name)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Namespace {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| StoreError::UnknownNamespace { name: s.to_owned() })
    }
}
