//! Staging of entity writes together with their location index entries.

use crate::store::keys::{location_key, object_key, sequence_key};
use crate::store::{Namespace, StoreError, WriteBatch};
use crate::{RoadLinkSequence, RoadObject};

/// Stage a wholesale replacement of a link sequence.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if the sequence cannot be serialised.
pub fn stage_put_sequence(
    batch: &mut WriteBatch,
    sequence: &RoadLinkSequence,
) -> Result<(), StoreError> {
    batch.put_json(Namespace::LinkSequences, sequence_key(sequence.id), sequence)
}

/// Stage removal of a link sequence.
pub fn stage_remove_sequence(batch: &mut WriteBatch, id: u64) {
    batch.delete(Namespace::LinkSequences, sequence_key(id));
}

/// Stage a new object version and reconcile its location index entries.
///
/// `previous` is the version being replaced, if any.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if the object cannot be serialised.
pub fn stage_put_object(
    batch: &mut WriteBatch,
    previous: Option<&RoadObject>,
    object: &RoadObject,
) -> Result<(), StoreError> {
    let key = object.key();
    let sequences = object.sequence_ids();
    if let Some(previous) = previous {
        for stale in previous.sequence_ids().difference(&sequences) {
            batch.delete(Namespace::LocationIndex, location_key(*stale, key));
        }
    }
    for &sequence_id in &sequences {
        batch.put(
            Namespace::LocationIndex,
            location_key(sequence_id, key),
            Vec::new(),
        );
    }
    batch.put_json(Namespace::RoadObjects, object_key(key), object)
}

/// Stage removal of an object and its location index entries.
pub fn stage_remove_object(batch: &mut WriteBatch, object: &RoadObject) {
    let key = object.key();
    for sequence_id in object.sequence_ids() {
        batch.delete(Namespace::LocationIndex, location_key(sequence_id, key));
    }
    batch.delete(Namespace::RoadObjects, object_key(key));
}
