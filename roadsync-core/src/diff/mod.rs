//! Hash-based classification of dirty features.
//!
//! [`FeatureDiffEngine::diff`] turns the drained ledger entries of one
//! object type into a list of [`FeatureChange`] values together with the
//! exported-feature bookkeeping that must be committed once the exporter has
//! accepted them. Ids whose content cannot be resolved are reported as
//! skipped and must stay dirty.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::exported::{ExportedFeature, ExportedFeatureStore, FeatureSummary};
use crate::feature::{
    Classification, FeatureChange, FeatureContent, FeatureRules, LocationEncoder, RebuildError,
    rebuild_feature,
};
use crate::hash::ContentHash;
use crate::ledger::DirtyObjectChange;
use crate::lookup::EntityLookup;
use crate::store::{VersionedStore, WriteBatch};
use crate::{ChangeKind, ObjectKey, TypeId};

/// An id left dirty because its content could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFeature {
    /// Feature identity.
    pub key: ObjectKey,
    /// Whether the id was only reached through a dirty link sequence.
    pub via_sequence: bool,
    /// Description of the failure.
    pub reason: String,
}

/// Outcome of diffing one object type.
#[derive(Debug, Default)]
pub struct DiffReport {
    /// Changes to hand to the exporter.
    pub changes: Vec<FeatureChange>,
    /// Ids whose content matches the last export, or that have nothing to remove.
    pub unchanged: Vec<ObjectKey>,
    /// Ids skipped this cycle.
    pub skipped: Vec<SkippedFeature>,
    /// Whether objects on the dirty link sequences could be resolved.
    pub sequences_resolved: bool,
    /// Exported-feature updates to commit after a successful export.
    pub bookkeeping: WriteBatch,
}

impl DiffReport {
    /// Whether every id reached through a dirty link sequence was settled.
    #[must_use]
    pub fn sequences_settled(&self) -> bool {
        self.sequences_resolved && !self.skipped.iter().any(|s| s.via_sequence)
    }

    /// The part of `drained` that may be acknowledged.
    #[must_use]
    pub fn acknowledgeable(
        &self,
        drained: &BTreeMap<u64, DirtyObjectChange>,
    ) -> BTreeMap<u64, DirtyObjectChange> {
        let skipped: BTreeSet<u64> = self.skipped.iter().map(|s| s.key.id).collect();
        drained
            .iter()
            .filter(|(id, _)| !skipped.contains(id))
            .map(|(&id, &change)| (id, change))
            .collect()
    }
}

/// Classifies dirty features against the exported-feature store.
pub struct FeatureDiffEngine<'a, S: ?Sized, L: ?Sized, E: ?Sized> {
    store: &'a S,
    lookup: &'a L,
    encoder: &'a E,
    rules: &'a FeatureRules,
}

impl<'a, S, L, E> FeatureDiffEngine<'a, S, L, E>
where
    S: VersionedStore + ?Sized,
    L: EntityLookup + ?Sized,
    E: LocationEncoder + ?Sized,
{
    /// Assemble an engine from its collaborators.
    #[must_use]
    pub const fn new(store: &'a S, lookup: &'a L, encoder: &'a E, rules: &'a FeatureRules) -> Self {
        Self {
            store,
            lookup,
            encoder,
            rules,
        }
    }

    /// Classify every feature of `type_id` affected by the drained entries.
    ///
    /// Affected ids are the drained object changes plus every object of the
    /// type located on a dirty link sequence.
    pub fn diff(
        &self,
        type_id: TypeId,
        object_changes: &BTreeMap<u64, DirtyObjectChange>,
        dirty_sequences: &BTreeSet<u64>,
        now: DateTime<Utc>,
    ) -> DiffReport {
        let mut report = DiffReport {
            sequences_resolved: true,
            ..DiffReport::default()
        };
        let mut affected: BTreeMap<u64, Option<DirtyObjectChange>> = object_changes
            .iter()
            .map(|(&id, &change)| (id, Some(change)))
            .collect();

        if !dirty_sequences.is_empty() {
            match self.lookup.objects_on_sequences(type_id, dirty_sequences) {
                Ok(ids) => {
                    for id in ids {
                        affected.entry(id).or_insert(None);
                    }
                }
                Err(err) => {
                    warn!("could not resolve objects on dirty link sequences for type {type_id}: {err}");
                    report.sequences_resolved = false;
                }
            }
        }

        for (id, change) in affected {
            self.classify(ObjectKey::new(type_id, id), change, now, &mut report);
        }
        debug!(
            "type {type_id}: {} changes, {} unchanged, {} skipped",
            report.changes.len(),
            report.unchanged.len(),
            report.skipped.len()
        );
        report
    }

    fn classify(
        &self,
        key: ObjectKey,
        change: Option<DirtyObjectChange>,
        now: DateTime<Utc>,
        report: &mut DiffReport,
    ) {
        let via_sequence = change.is_none();
        let skip = |report: &mut DiffReport, reason: String| {
            warn!("skipping feature {key} this cycle: {reason}");
            report.skipped.push(SkippedFeature {
                key,
                via_sequence,
                reason,
            });
        };

        let exported = ExportedFeatureStore::new(self.store);
        let previous = match exported.get(key) {
            Ok(previous) => previous,
            Err(err) if err.is_decode() => {
                warn!("treating undecodable export record of {key} as absent: {err}");
                None
            }
            Err(err) => return skip(report, err.to_string()),
        };

        let deleted = change.is_some_and(|c| c.kind == ChangeKind::Deleted);
        let current = if deleted {
            None
        } else {
            match self.current_content(key) {
                Ok(current) => current,
                Err(err) => return skip(report, err.to_string()),
            }
        };

        let Some((version, content)) = current else {
            if previous.is_some() {
                exported.stage_remove(&mut report.bookkeeping, key);
                report.changes.push(FeatureChange {
                    key,
                    version: change.map(|c| c.version),
                    classification: Classification::Remove,
                    content: None,
                    content_hash: None,
                });
            } else {
                report.unchanged.push(key);
            }
            return;
        };

        let hash = match ContentHash::of(&content) {
            Ok(hash) => hash,
            Err(err) => return skip(report, err.to_string()),
        };
        if previous.as_ref().is_some_and(|p| p.content_hash == hash) {
            report.unchanged.push(key);
            return;
        }

        let classification = if previous.is_some() {
            Classification::Modify
        } else {
            Classification::Add
        };
        let record = ExportedFeature {
            key,
            content_hash: hash,
            classification,
            exported_at: now,
            summary: summarise(version, &content),
        };
        if let Err(err) = exported.stage_record(&mut report.bookkeeping, &record) {
            return skip(report, err.to_string());
        }
        report.changes.push(FeatureChange {
            key,
            version: Some(version),
            classification,
            content: Some(content),
            content_hash: Some(hash),
        });
    }

    fn current_content(&self, key: ObjectKey) -> Result<Option<(u32, FeatureContent)>, RebuildError> {
        let Some(object) = self.lookup.road_object(key)? else {
            return Ok(None);
        };
        let content = rebuild_feature(&object, self.rules, self.lookup, self.encoder)?;
        Ok(content.map(|content| (object.version, content)))
    }
}

fn summarise(version: u32, content: &FeatureContent) -> FeatureSummary {
    let sequence_ids: BTreeSet<u64> = content
        .locations
        .iter()
        .map(|location| location.reference.sequence_id)
        .collect();
    FeatureSummary {
        version: Some(version),
        location_count: content.locations.len(),
        sequence_ids: sequence_ids.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests;
