//! Read access to replicated entities for feature reconstruction.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::store::keys::{decode_location_key, location_prefix, object_key, sequence_key};
use crate::store::{Namespace, StoreError, StoreExt, VersionedStore};
use crate::{ObjectKey, RoadLinkSequence, RoadObject, TypeId};

/// Errors raised while resolving entities.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The underlying store failed or held an undecodable record.
    #[error("failed to read {entity}")]
    Store {
        /// Description of the entity being read.
        entity: String,
        /// Store failure.
        #[source]
        source: StoreError,
    },
}

/// Resolves current entity state.
pub trait EntityLookup {
    /// Current state of a road object.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when the object cannot be read.
    fn road_object(&self, key: ObjectKey) -> Result<Option<RoadObject>, LookupError>;

    /// Current state of a link sequence.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when the sequence cannot be read.
    fn link_sequence(&self, id: u64) -> Result<Option<RoadLinkSequence>, LookupError>;

    /// Ids of `type_id` objects located on any of `sequence_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when the index cannot be read.
    fn objects_on_sequences(
        &self,
        type_id: TypeId,
        sequence_ids: &BTreeSet<u64>,
    ) -> Result<BTreeSet<u64>, LookupError>;
}

/// [`EntityLookup`] reading straight from a [`VersionedStore`].
#[derive(Debug)]
pub struct StoreLookup<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: VersionedStore + ?Sized> StoreLookup<'a, S> {
    /// Wrap `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }
}

impl<S: VersionedStore + ?Sized> EntityLookup for StoreLookup<'_, S> {
    fn road_object(&self, key: ObjectKey) -> Result<Option<RoadObject>, LookupError> {
        self.store
            .get_json(Namespace::RoadObjects, &object_key(key))
            .map_err(|source| LookupError::Store {
                entity: format!("road object {key}"),
                source,
            })
    }

    fn link_sequence(&self, id: u64) -> Result<Option<RoadLinkSequence>, LookupError> {
        self.store
            .get_json(Namespace::LinkSequences, &sequence_key(id))
            .map_err(|source| LookupError::Store {
                entity: format!("link sequence {id}"),
                source,
            })
    }

    fn objects_on_sequences(
        &self,
        type_id: TypeId,
        sequence_ids: &BTreeSet<u64>,
    ) -> Result<BTreeSet<u64>, LookupError> {
        let mut ids = BTreeSet::new();
        for &sequence_id in sequence_ids {
            let prefix = location_prefix(sequence_id, type_id);
            for entry in self.store.iter_prefix(Namespace::LocationIndex, &prefix) {
                let entry = entry.map_err(|source| LookupError::Store {
                    entity: format!("location index of sequence {sequence_id}"),
                    source,
                })?;
                if let Some((_, key)) = decode_location_key(&entry.key) {
                    ids.insert(key.id);
                }
            }
        }
        Ok(ids)
    }
}
