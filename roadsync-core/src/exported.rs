//! Durable record of what was last exported per feature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feature::Classification;
use crate::hash::ContentHash;
use crate::store::keys::{decode_object_key, object_key, type_prefix};
use crate::store::{Namespace, StoreError, StoreExt, VersionedStore, WriteBatch, decode_json};
use crate::{ObjectKey, TypeId};

/// Short description of the last exported content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSummary {
    /// Object version that was exported.
    pub version: Option<u32>,
    /// Number of location references.
    pub location_count: usize,
    /// Distinct sequences the feature was located on.
    pub sequence_ids: Vec<u64>,
}

/// Bookkeeping stored for an exported feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFeature {
    /// Feature identity.
    pub key: ObjectKey,
    /// Hash of the exported content.
    pub content_hash: ContentHash,
    /// Classification of the last export.
    pub classification: Classification,
    /// Time of the last export.
    pub exported_at: DateTime<Utc>,
    /// Summary of the exported content.
    pub summary: FeatureSummary,
}

/// View of the exported features namespace.
#[derive(Debug)]
pub struct ExportedFeatureStore<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: VersionedStore + ?Sized> ExportedFeatureStore<'a, S> {
    /// Wrap `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Last export record of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] for an undecodable record and
    /// propagates read failures.
    pub fn get(&self, key: ObjectKey) -> Result<Option<ExportedFeature>, StoreError> {
        self.store
            .get_json(Namespace::ExportedFeatures, &object_key(key))
    }

    /// Stage a new record for an added or modified feature.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] when the record cannot be serialised.
    pub fn stage_record(
        &self,
        batch: &mut WriteBatch,
        record: &ExportedFeature,
    ) -> Result<(), StoreError> {
        batch.put_json(Namespace::ExportedFeatures, object_key(record.key), record)
    }

    /// Stage removal of the record of a removed feature.
    pub fn stage_remove(&self, batch: &mut WriteBatch, key: ObjectKey) {
        batch.delete(Namespace::ExportedFeatures, object_key(key));
    }

    /// Every record of `type_id`, skipping undecodable entries.
    ///
    /// # Errors
    ///
    /// Propagates scan failures.
    pub fn list(&self, type_id: TypeId) -> Result<Vec<ExportedFeature>, StoreError> {
        let mut records = Vec::new();
        for entry in self
            .store
            .iter_prefix(Namespace::ExportedFeatures, &type_prefix(type_id))
        {
            let entry = entry?;
            if decode_object_key(&entry.key).is_none() {
                continue;
            }
            match decode_json(Namespace::ExportedFeatures, &entry.key, &entry.value) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("skipping exported feature record: {err}"),
            }
        }
        Ok(records)
    }
}
