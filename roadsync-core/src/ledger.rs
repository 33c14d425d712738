//! Dirty-change ledger recording entities changed since the last export.
//!
//! Marks are staged into a caller-owned [`WriteBatch`] so they commit
//! together with the entity writes that caused them. Draining only reads;
//! entries disappear through [`ChangeLedger::stage_acknowledge_objects`],
//! [`ChangeLedger::stage_acknowledge_link_sequences`] or
//! [`ChangeLedger::clear_all`], once the exporter has durably accepted the
//! corresponding changes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::keys::{
    decode_object_key, decode_sequence_key, object_key, sequence_key, type_prefix,
};
use crate::store::{Namespace, StoreError, StoreExt, VersionedStore, WriteBatch, decode_json};
use crate::{ChangeKind, ObjectKey, TypeId};

/// Pending change recorded for a single road object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyObjectChange {
    /// Merged change kind.
    pub kind: ChangeKind,
    /// Highest version observed for the change.
    pub version: u32,
    /// Time the change was last observed.
    pub discovered_at: DateTime<Utc>,
}

impl DirtyObjectChange {
    /// A modification of `version` observed at `discovered_at`.
    #[must_use]
    pub const fn modified(version: u32, discovered_at: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Modified,
            version,
            discovered_at,
        }
    }

    /// A removal of `version` observed at `discovered_at`.
    #[must_use]
    pub const fn deleted(version: u32, discovered_at: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            version,
            discovered_at,
        }
    }

    /// Combine an existing mark with a newer observation.
    ///
    /// Any removal wins over a modification, whatever the arrival order,
    /// unless the modification carries a version strictly above the removed
    /// one, which means the object was re-created upstream.
    #[must_use]
    pub fn merge(self, incoming: Self) -> Self {
        let discovered_at = self.discovered_at.max(incoming.discovered_at);
        let version = self.version.max(incoming.version);
        let kind = match (self.kind, incoming.kind) {
            (ChangeKind::Deleted, ChangeKind::Modified) if incoming.version > self.version => {
                ChangeKind::Modified
            }
            (ChangeKind::Modified, ChangeKind::Modified) => ChangeKind::Modified,
            _ => ChangeKind::Deleted,
        };
        Self {
            kind,
            version,
            discovered_at,
        }
    }
}

/// Kind of entity a dirty entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A link sequence.
    LinkSequence,
    /// A road object of the given type.
    Object(TypeId),
}

/// A pending dirty entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyEntry {
    /// Kind of the entity.
    pub kind: EntityKind,
    /// Entity identifier.
    pub id: u64,
    /// Time the change was last observed.
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DirtySequence {
    discovered_at: DateTime<Utc>,
}

/// Accumulates object marks for one batch, merging repeated ids.
#[derive(Debug, Default, Clone)]
pub struct ObjectMarks {
    pending: BTreeMap<ObjectKey, DirtyObjectChange>,
}

impl ObjectMarks {
    /// Record an observation, merging with any earlier one for the same key.
    pub fn record(&mut self, key: ObjectKey, change: DirtyObjectChange) {
        self.pending
            .entry(key)
            .and_modify(|existing| *existing = existing.merge(change))
            .or_insert(change);
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of distinct keys recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Ledger view over a [`VersionedStore`].
pub struct ChangeLedger<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: VersionedStore + ?Sized> ChangeLedger<'a, S> {
    /// Wrap `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Stage dirty marks for link sequences into `batch`.
    ///
    /// Re-marking refreshes the discovery timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] if a mark cannot be serialised.
    pub fn stage_link_sequences_dirty(
        &self,
        batch: &mut WriteBatch,
        ids: impl IntoIterator<Item = u64>,
        discovered_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for id in ids {
            batch.put_json(
                Namespace::DirtyLinkSequences,
                sequence_key(id),
                &DirtySequence { discovered_at },
            )?;
        }
        Ok(())
    }

    /// Mark link sequences dirty in a batch of their own.
    ///
    /// # Errors
    ///
    /// Propagates encoding and commit failures.
    pub fn mark_link_sequences_dirty(
        &self,
        ids: impl IntoIterator<Item = u64>,
        discovered_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        self.stage_link_sequences_dirty(&mut batch, ids, discovered_at)?;
        self.store.commit(batch)
    }

    /// Stage object marks into `batch`, merging with stored marks.
    ///
    /// # Errors
    ///
    /// Propagates read and encoding failures. An undecodable stored mark is
    /// replaced by the incoming one.
    pub fn stage_object_marks(
        &self,
        batch: &mut WriteBatch,
        marks: ObjectMarks,
    ) -> Result<(), StoreError> {
        for (key, change) in marks.pending {
            let raw_key = object_key(key);
            let merged = match self
                .store
                .get_json::<DirtyObjectChange>(Namespace::DirtyObjects, &raw_key)
            {
                Ok(Some(existing)) => existing.merge(change),
                Ok(None) => change,
                Err(err) if err.is_decode() => {
                    warn!("replacing undecodable dirty mark for object {key}: {err}");
                    change
                }
                Err(err) => return Err(err),
            };
            batch.put_json(Namespace::DirtyObjects, raw_key, &merged)?;
        }
        Ok(())
    }

    /// Mark objects of `type_id` dirty in a batch of their own.
    ///
    /// # Errors
    ///
    /// Propagates read, encoding and commit failures.
    pub fn mark_objects_dirty(
        &self,
        type_id: TypeId,
        changes: impl IntoIterator<Item = (u64, DirtyObjectChange)>,
    ) -> Result<(), StoreError> {
        let mut marks = ObjectMarks::default();
        for (id, change) in changes {
            marks.record(ObjectKey::new(type_id, id), change);
        }
        let mut batch = WriteBatch::new();
        self.stage_object_marks(&mut batch, marks)?;
        self.store.commit(batch)
    }

    /// Snapshot the pending object changes of `type_id` without clearing them.
    ///
    /// Undecodable entries are logged and left in place.
    ///
    /// # Errors
    ///
    /// Propagates scan failures.
    pub fn drain_dirty_object_changes(
        &self,
        type_id: TypeId,
    ) -> Result<BTreeMap<u64, DirtyObjectChange>, StoreError> {
        let mut changes = BTreeMap::new();
        for entry in self
            .store
            .iter_prefix(Namespace::DirtyObjects, &type_prefix(type_id))
        {
            let entry = entry?;
            let Some(key) = decode_object_key(&entry.key) else {
                warn!("skipping malformed dirty object key {:02x?}", entry.key);
                continue;
            };
            match decode_json::<DirtyObjectChange>(Namespace::DirtyObjects, &entry.key, &entry.value)
            {
                Ok(change) => {
                    changes.insert(key.id, change);
                }
                Err(err) => warn!("skipping dirty mark for object {key}: {err}"),
            }
        }
        Ok(changes)
    }

    /// Snapshot the pending link sequence marks with their timestamps.
    ///
    /// # Errors
    ///
    /// Propagates scan failures.
    pub fn drain_dirty_link_sequences(&self) -> Result<BTreeMap<u64, DateTime<Utc>>, StoreError> {
        let mut marks = BTreeMap::new();
        for entry in self.store.iter_prefix(Namespace::DirtyLinkSequences, &[]) {
            let entry = entry?;
            let Some(id) = decode_sequence_key(&entry.key) else {
                warn!("skipping malformed dirty sequence key {:02x?}", entry.key);
                continue;
            };
            match decode_json::<DirtySequence>(Namespace::DirtyLinkSequences, &entry.key, &entry.value)
            {
                Ok(mark) => {
                    marks.insert(id, mark.discovered_at);
                }
                Err(err) => warn!("skipping dirty mark for link sequence {id}: {err}"),
            }
        }
        Ok(marks)
    }

    /// Snapshot the ids of pending link sequence marks.
    ///
    /// # Errors
    ///
    /// Propagates scan failures.
    pub fn drain_dirty_link_sequence_ids(&self) -> Result<BTreeSet<u64>, StoreError> {
        Ok(self.drain_dirty_link_sequences()?.into_keys().collect())
    }

    /// Every pending entry, link sequences first.
    ///
    /// # Errors
    ///
    /// Propagates scan failures.
    pub fn pending(&self, types: &[TypeId]) -> Result<Vec<DirtyEntry>, StoreError> {
        let mut entries: Vec<DirtyEntry> = self
            .drain_dirty_link_sequences()?
            .into_iter()
            .map(|(id, discovered_at)| DirtyEntry {
                kind: EntityKind::LinkSequence,
                id,
                discovered_at,
            })
            .collect();
        for &type_id in types {
            entries.extend(self.drain_dirty_object_changes(type_id)?.into_iter().map(
                |(id, change)| DirtyEntry {
                    kind: EntityKind::Object(type_id),
                    id,
                    discovered_at: change.discovered_at,
                },
            ));
        }
        Ok(entries)
    }

    /// Stage removal of drained object marks that are still unchanged.
    ///
    /// Marks updated after `snapshot` was taken stay in the ledger.
    ///
    /// # Errors
    ///
    /// Propagates read failures other than undecodable entries.
    pub fn stage_acknowledge_objects(
        &self,
        batch: &mut WriteBatch,
        type_id: TypeId,
        snapshot: &BTreeMap<u64, DirtyObjectChange>,
    ) -> Result<(), StoreError> {
        for (&id, drained) in snapshot {
            let raw_key = object_key(ObjectKey::new(type_id, id));
            match self
                .store
                .get_json::<DirtyObjectChange>(Namespace::DirtyObjects, &raw_key)
            {
                Ok(Some(current)) if current == *drained => {
                    batch.delete(Namespace::DirtyObjects, raw_key);
                }
                Ok(_) => {}
                Err(err) if err.is_decode() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Stage removal of drained link sequence marks that are still unchanged.
    ///
    /// # Errors
    ///
    /// Propagates read failures other than undecodable entries.
    pub fn stage_acknowledge_link_sequences(
        &self,
        batch: &mut WriteBatch,
        snapshot: &BTreeMap<u64, DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        for (&id, &discovered_at) in snapshot {
            let raw_key = sequence_key(id);
            match self
                .store
                .get_json::<DirtySequence>(Namespace::DirtyLinkSequences, &raw_key)
            {
                Ok(Some(current)) if current.discovered_at == discovered_at => {
                    batch.delete(Namespace::DirtyLinkSequences, raw_key);
                }
                Ok(_) => {}
                Err(err) if err.is_decode() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Remove every pending mark of `type_id`.
    ///
    /// # Errors
    ///
    /// Propagates scan and commit failures.
    pub fn clear_all(&self, type_id: TypeId) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for entry in self
            .store
            .iter_prefix(Namespace::DirtyObjects, &type_prefix(type_id))
        {
            batch.delete(Namespace::DirtyObjects, entry?.key);
        }
        self.store.commit(batch)
    }

    /// Remove every pending link sequence mark.
    ///
    /// # Errors
    ///
    /// Propagates clear failures.
    pub fn clear_link_sequences(&self) -> Result<(), StoreError> {
        self.store.clear_namespace(Namespace::DirtyLinkSequences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rstest::{fixture, rstest};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    #[fixture]
    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[rstest]
    fn removal_dominates_regardless_of_order() {
        let v1 = DirtyObjectChange::deleted(1, at(0));
        let v2 = DirtyObjectChange::deleted(2, at(1));
        assert_eq!(v1.merge(v2).kind, ChangeKind::Deleted);
        assert_eq!(v2.merge(v1).kind, ChangeKind::Deleted);
        assert_eq!(v2.merge(v1).version, 2);
    }

    #[rstest]
    fn stale_modification_does_not_resurrect() {
        let deleted = DirtyObjectChange::deleted(3, at(0));
        let merged = deleted.merge(DirtyObjectChange::modified(3, at(5)));
        assert_eq!(merged.kind, ChangeKind::Deleted);
        assert_eq!(merged.discovered_at, at(5));
    }

    #[rstest]
    fn newer_modification_recreates() {
        let deleted = DirtyObjectChange::deleted(3, at(0));
        let merged = deleted.merge(DirtyObjectChange::modified(4, at(1)));
        assert_eq!(merged.kind, ChangeKind::Modified);
        assert_eq!(merged.version, 4);
    }

    #[rstest]
    fn remarking_merges_with_stored_entry(store: MemoryStore) {
        let ledger = ChangeLedger::new(&store);
        ledger
            .mark_objects_dirty(105, [(7, DirtyObjectChange::deleted(1, at(0)))])
            .expect("mark");
        ledger
            .mark_objects_dirty(105, [(7, DirtyObjectChange::modified(1, at(2)))])
            .expect("re-mark");
        let drained = ledger.drain_dirty_object_changes(105).expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.get(&7).map(|c| c.kind), Some(ChangeKind::Deleted));
    }

    #[rstest]
    fn draining_does_not_clear(store: MemoryStore) {
        let ledger = ChangeLedger::new(&store);
        ledger.mark_link_sequences_dirty([1, 2], at(0)).expect("mark");
        assert_eq!(
            ledger.drain_dirty_link_sequence_ids().expect("drain"),
            BTreeSet::from([1, 2])
        );
        assert_eq!(
            ledger.drain_dirty_link_sequence_ids().expect("drain again"),
            BTreeSet::from([1, 2])
        );
    }

    #[rstest]
    fn acknowledgement_keeps_entries_remarked_after_drain(store: MemoryStore) {
        let ledger = ChangeLedger::new(&store);
        ledger
            .mark_objects_dirty(
                105,
                [
                    (1, DirtyObjectChange::modified(1, at(0))),
                    (2, DirtyObjectChange::modified(1, at(0))),
                ],
            )
            .expect("mark");
        let snapshot = ledger.drain_dirty_object_changes(105).expect("drain");
        ledger
            .mark_objects_dirty(105, [(2, DirtyObjectChange::modified(2, at(3)))])
            .expect("re-mark after drain");

        let mut batch = WriteBatch::new();
        ledger
            .stage_acknowledge_objects(&mut batch, 105, &snapshot)
            .expect("acknowledge");
        store.commit(batch).expect("commit");

        let remaining = ledger.drain_dirty_object_changes(105).expect("drain");
        assert_eq!(remaining.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[rstest]
    fn clear_all_is_scoped_to_one_type(store: MemoryStore) {
        let ledger = ChangeLedger::new(&store);
        ledger
            .mark_objects_dirty(105, [(1, DirtyObjectChange::modified(1, at(0)))])
            .expect("mark");
        ledger
            .mark_objects_dirty(581, [(1, DirtyObjectChange::modified(1, at(0)))])
            .expect("mark");
        ledger.clear_all(105).expect("clear");
        assert!(ledger.drain_dirty_object_changes(105).expect("drain").is_empty());
        assert_eq!(ledger.drain_dirty_object_changes(581).expect("drain").len(), 1);
    }

    #[rstest]
    fn pending_lists_every_entry(store: MemoryStore) {
        let ledger = ChangeLedger::new(&store);
        ledger.mark_link_sequences_dirty([9], at(0)).expect("mark");
        ledger
            .mark_objects_dirty(105, [(1, DirtyObjectChange::modified(1, at(1)))])
            .expect("mark");
        let pending = ledger.pending(&[105]).expect("pending");
        assert_eq!(
            pending.iter().map(|e| (e.kind, e.id)).collect::<Vec<_>>(),
            vec![(EntityKind::LinkSequence, 9), (EntityKind::Object(105), 1)]
        );
    }

    #[rstest]
    fn undecodable_marks_are_skipped(store: MemoryStore) {
        store
            .put(
                Namespace::DirtyObjects,
                object_key(ObjectKey::new(105, 1)),
                b"garbage".to_vec(),
            )
            .expect("put");
        let ledger = ChangeLedger::new(&store);
        assert!(ledger.drain_dirty_object_changes(105).expect("drain").is_empty());
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn change() -> impl Strategy<Value = DirtyObjectChange> {
        (any::<bool>(), 1_u32..6, 0_i64..600).prop_map(|(deleted, version, second)| {
            let at = Utc
                .timestamp_opt(1_700_000_000 + second, 0)
                .single()
                .unwrap_or_default();
            if deleted {
                DirtyObjectChange::deleted(version, at)
            } else {
                DirtyObjectChange::modified(version, at)
            }
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn removals_resolve_to_deleted_for_any_order(
            mut removals in prop::collection::vec(change().prop_map(|c| DirtyObjectChange { kind: ChangeKind::Deleted, ..c }), 1..6)
        ) {
            let forward = removals.iter().copied().reduce(DirtyObjectChange::merge);
            removals.reverse();
            let backward = removals.iter().copied().reduce(DirtyObjectChange::merge);
            prop_assert_eq!(forward.map(|c| c.kind), Some(ChangeKind::Deleted));
            prop_assert_eq!(backward.map(|c| c.kind), Some(ChangeKind::Deleted));
            prop_assert_eq!(forward.map(|c| c.version), backward.map(|c| c.version));
        }

        #[test]
        fn merge_never_loses_the_latest_timestamp(a in change(), b in change()) {
            let merged = a.merge(b);
            prop_assert_eq!(merged.discovered_at, a.discovered_at.max(b.discovered_at));
            prop_assert_eq!(merged.version, a.version.max(b.version));
        }
    }
}
