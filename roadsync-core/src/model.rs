//! Road network entities replicated from the upstream dataset.
//!
//! Link sequences carry the geometry of the network, while road objects
//! (speed limits, signage, surface types and so on) reference positions on
//! those sequences through [`LinearLocation`] values.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use geo::LineString;
use serde::{Deserialize, Serialize};

/// Identifier of a road object type.
pub type TypeId = u32;

/// Interval during which a road link is part of the network.
///
/// An absent `end` marks a link that is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    /// First day the link is valid.
    pub start: NaiveDate,
    /// Day the link stopped being valid, if it has been superseded.
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl Validity {
    /// Construct an open-ended validity interval.
    #[must_use]
    pub const fn open(start: NaiveDate) -> Self {
        Self { start, end: None }
    }

    /// Whether the link is still current.
    #[must_use]
    pub const fn is_current(&self) -> bool {
        self.end.is_none()
    }

    /// Whether the validity ended strictly before `cutoff`.
    #[must_use]
    pub fn ended_before(&self, cutoff: NaiveDate) -> bool {
        self.end.is_some_and(|end| end < cutoff)
    }
}

/// A single link within a [`RoadLinkSequence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadLink {
    /// Fractional start position along the parent sequence, in `[0, 1]`.
    pub start_position: f64,
    /// Fractional end position along the parent sequence, in `[0, 1]`.
    pub end_position: f64,
    /// Link geometry in WGS84 (`x = longitude`, `y = latitude`).
    pub geometry: LineString<f64>,
    /// Validity interval of this link.
    pub validity: Validity,
    /// Node at the start of the link.
    pub start_node: u64,
    /// Node at the end of the link.
    pub end_node: u64,
}

impl RoadLink {
    /// Whether the link overlaps the closed fractional range `[from, to]`.
    ///
    /// Point ranges (`from == to`) overlap a link that contains the point.
    #[must_use]
    pub fn overlaps(&self, from: f64, to: f64) -> bool {
        if from == to {
            return self.start_position <= from && from <= self.end_position;
        }
        self.start_position < to && self.end_position > from
    }
}

/// An ordered chain of road links identified by a sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadLinkSequence {
    /// Sequence identifier.
    pub id: u64,
    /// Links ordered by start position.
    pub links: Vec<RoadLink>,
}

impl RoadLinkSequence {
    /// Links that have not been superseded.
    pub fn current_links(&self) -> impl Iterator<Item = &RoadLink> {
        self.links.iter().filter(|link| link.validity.is_current())
    }

    /// Drop links whose validity ended before `cutoff`.
    ///
    /// Returns the number of links removed.
    pub fn prune_superseded(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.links.len();
        self.links.retain(|link| !link.validity.ended_before(cutoff));
        before - self.links.len()
    }
}

/// Travel direction relative to the digitised direction of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Same direction as the sequence geometry.
    With,
    /// Opposite to the sequence geometry.
    Against,
    /// Both directions.
    Both,
}

/// A reference to a stretch of a link sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearLocation {
    /// Referenced link sequence.
    pub sequence_id: u64,
    /// Fractional start position.
    pub start: f64,
    /// Fractional end position.
    pub end: f64,
    /// Optional direction of validity.
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Lane codes the location applies to.
    #[serde(default)]
    pub lanes: Vec<String>,
}

/// A typed property value attached to a road object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    /// Whole number.
    Integer(i64),
    /// Floating-point number.
    Real(f64),
    /// Free text or an enumerated code.
    Text(String),
    /// Flag.
    Boolean(bool),
}

/// Composite identity of a road object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Object type.
    pub type_id: TypeId,
    /// Object identifier, unique within the type.
    pub id: u64,
}

impl ObjectKey {
    /// Construct a key.
    #[must_use]
    pub const fn new(type_id: TypeId, id: u64) -> Self {
        Self { type_id, id }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.id)
    }
}

/// A versioned road object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadObject {
    /// Object type.
    pub type_id: TypeId,
    /// Object identifier.
    pub id: u64,
    /// Monotonically increasing version number.
    pub version: u32,
    /// Last modification time reported upstream.
    pub last_modified: DateTime<Utc>,
    /// Named property values.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Positions on the network the object applies to.
    #[serde(default)]
    pub locations: Vec<LinearLocation>,
}

impl RoadObject {
    /// Composite key of this object.
    #[must_use]
    pub const fn key(&self) -> ObjectKey {
        ObjectKey::new(self.type_id, self.id)
    }

    /// Distinct link sequences referenced by the object's locations.
    #[must_use]
    pub fn sequence_ids(&self) -> BTreeSet<u64> {
        self.locations
            .iter()
            .map(|location| location.sequence_id)
            .collect()
    }
}

/// A replicated entity stream.
///
/// Link sequences form one stream; each road object type forms its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityStream {
    /// All link sequences.
    LinkSequences,
    /// Road objects of one type.
    Objects(TypeId),
}

impl EntityStream {
    /// Streams replicated for the configured object types, link sequences first.
    #[must_use]
    pub fn for_types(types: &[TypeId]) -> Vec<Self> {
        std::iter::once(Self::LinkSequences)
            .chain(types.iter().copied().map(Self::Objects))
            .collect()
    }
}

impl fmt::Display for EntityStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkSequences => f.write_str("link-sequences"),
            Self::Objects(type_id) => write!(f, "objects-{type_id}"),
        }
    }
}

/// Kind of change recorded against an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The entity was created or updated.
    Modified,
    /// The entity was removed upstream.
    Deleted,
}
