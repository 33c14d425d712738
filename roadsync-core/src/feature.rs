//! Exportable feature content and its reconstruction from stored entities.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use geo::LineString;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::lookup::{EntityLookup, LookupError};
use crate::{LinearLocation, ObjectKey, PropertyValue, RoadLinkSequence, RoadObject, TypeId};

/// A location reference together with the geometry it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedLocation {
    /// Reference as stored on the object.
    pub reference: LinearLocation,
    /// Geometry of the covered links, in sequence order.
    pub geometry: Vec<LineString<f64>>,
}

/// The exportable payload of a feature.
///
/// Only geometry, property values and location references take part; the
/// object version, its timestamps and any update classification are kept
/// outside so they never influence the content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContent {
    /// Object type of the feature.
    pub type_id: TypeId,
    /// Property values.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Location references in canonical order.
    pub locations: Vec<EncodedLocation>,
}

/// How a feature changed relative to its last export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Not exported before.
    Add,
    /// Exported before with different content.
    Modify,
    /// Exported before and now gone or no longer valid.
    Remove,
}

/// A change handed to the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureChange {
    /// Feature identity.
    pub key: ObjectKey,
    /// Object version the change was derived from, when the object exists.
    pub version: Option<u32>,
    /// Classification of the change.
    pub classification: Classification,
    /// Content for additions and modifications.
    pub content: Option<FeatureContent>,
    /// Hash of `content`.
    pub content_hash: Option<ContentHash>,
}

/// Errors raised by a [`LocationEncoder`].
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The location's fractions are outside `[0, 1]` or not numbers.
    #[error("location on sequence {sequence_id} has invalid range {start}..{end}")]
    InvalidRange {
        /// Referenced sequence.
        sequence_id: u64,
        /// Start fraction.
        start: f64,
        /// End fraction.
        end: f64,
    },
    /// The location references a sequence other than the one supplied.
    #[error("location references sequence {expected} but sequence {found} was supplied")]
    SequenceMismatch {
        /// Sequence named by the location.
        expected: u64,
        /// Sequence passed to the encoder.
        found: u64,
    },
}

/// Encodes a linear location against the geometry of its sequence.
pub trait LocationEncoder: Send + Sync {
    /// Produce the encoded form of `location`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] when the location cannot be encoded.
    fn encode(
        &self,
        location: &LinearLocation,
        sequence: &RoadLinkSequence,
    ) -> Result<EncodedLocation, EncodeError>;
}

/// Encoder attaching the geometry of every current link the location overlaps.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkGeometryEncoder;

impl LocationEncoder for LinkGeometryEncoder {
    fn encode(
        &self,
        location: &LinearLocation,
        sequence: &RoadLinkSequence,
    ) -> Result<EncodedLocation, EncodeError> {
        if location.sequence_id != sequence.id {
            return Err(EncodeError::SequenceMismatch {
                expected: location.sequence_id,
                found: sequence.id,
            });
        }
        let valid = |f: f64| (0.0..=1.0).contains(&f);
        if !valid(location.start) || !valid(location.end) {
            return Err(EncodeError::InvalidRange {
                sequence_id: location.sequence_id,
                start: location.start,
                end: location.end,
            });
        }
        let from = location.start.min(location.end);
        let to = location.start.max(location.end);
        let geometry = sequence
            .current_links()
            .filter(|link| link.overlaps(from, to))
            .map(|link| link.geometry.clone())
            .collect();
        Ok(EncodedLocation {
            reference: location.clone(),
            geometry,
        })
    }
}

/// Object types and the properties each must carry to be exportable.
#[derive(Debug, Default, Clone)]
pub struct FeatureRules {
    required: BTreeMap<TypeId, BTreeSet<String>>,
}

impl FeatureRules {
    /// Require `properties` on every object of `type_id`.
    #[must_use]
    pub fn require<I, P>(mut self, type_id: TypeId, properties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.required
            .entry(type_id)
            .or_default()
            .extend(properties.into_iter().map(Into::into));
        self
    }

    /// Properties required for `type_id`.
    pub fn required(&self, type_id: TypeId) -> impl Iterator<Item = &str> {
        self.required
            .get(&type_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

/// Reasons a feature could not be rebuilt this cycle.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    /// Reading related entities failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// A location could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Rebuild the exportable content of `object`.
///
/// Returns `Ok(None)` when the object has no valid content: no properties, a
/// missing required property, no locations, a location on an unknown
/// sequence, or a location that covers no current geometry.
///
/// # Errors
///
/// Returns [`RebuildError`] when related entities cannot be read or a
/// location cannot be encoded.
pub fn rebuild_feature<L, E>(
    object: &RoadObject,
    rules: &FeatureRules,
    lookup: &L,
    encoder: &E,
) -> Result<Option<FeatureContent>, RebuildError>
where
    L: EntityLookup + ?Sized,
    E: LocationEncoder + ?Sized,
{
    if object.properties.is_empty() || object.locations.is_empty() {
        return Ok(None);
    }
    if rules
        .required(object.type_id)
        .any(|name| !object.properties.contains_key(name))
    {
        return Ok(None);
    }

    let mut references: Vec<&LinearLocation> = object.locations.iter().collect();
    references.sort_by(|a, b| canonical_order(a, b));

    let mut locations = Vec::with_capacity(references.len());
    for reference in references {
        let Some(sequence) = lookup.link_sequence(reference.sequence_id)? else {
            return Ok(None);
        };
        let encoded = encoder.encode(reference, &sequence)?;
        if encoded.geometry.is_empty() {
            return Ok(None);
        }
        locations.push(encoded);
    }

    Ok(Some(FeatureContent {
        type_id: object.type_id,
        properties: object.properties.clone(),
        locations,
    }))
}

fn canonical_order(a: &LinearLocation, b: &LinearLocation) -> Ordering {
    a.sequence_id
        .cmp(&b.sequence_id)
        .then_with(|| a.start.total_cmp(&b.start))
        .then_with(|| a.end.total_cmp(&b.end))
        .then_with(|| a.direction.cmp(&b.direction))
        .then_with(|| a.lanes.cmp(&b.lanes))
}
