//! Unit tests for the feature diff engine.

use super::*;
use crate::feature::LinkGeometryEncoder;
use crate::lookup::StoreLookup;
use crate::store::keys::object_key;
use crate::store::{MemoryStore, Namespace};
use crate::test_support::{SPEED_LIMIT, fixture_time, sample_object, sample_sequence, seed_entities};
use rstest::{fixture, rstest};

struct Harness {
    store: MemoryStore,
    rules: FeatureRules,
}

impl Harness {
    fn diff(
        &self,
        changes: &BTreeMap<u64, DirtyObjectChange>,
        sequences: &BTreeSet<u64>,
    ) -> DiffReport {
        let lookup = StoreLookup::new(&self.store);
        let engine = FeatureDiffEngine::new(&self.store, &lookup, &LinkGeometryEncoder, &self.rules);
        engine.diff(SPEED_LIMIT, changes, sequences, fixture_time())
    }

    fn export(&self, changes: &BTreeMap<u64, DirtyObjectChange>) -> DiffReport {
        let report = self.diff(changes, &BTreeSet::new());
        self.store
            .commit(report.bookkeeping.clone())
            .expect("commit bookkeeping");
        report
    }
}

fn modified(id: u64, version: u32) -> BTreeMap<u64, DirtyObjectChange> {
    BTreeMap::from([(id, DirtyObjectChange::modified(version, fixture_time()))])
}

#[fixture]
fn harness() -> Harness {
    let store = MemoryStore::new();
    seed_entities(
        &store,
        &[sample_sequence(42), sample_sequence(43)],
        &[sample_object(1, 1, 42, 80), sample_object(2, 1, 43, 60)],
    )
    .expect("seed entities");
    Harness {
        store,
        rules: FeatureRules::default().require(SPEED_LIMIT, ["speed"]),
    }
}

#[rstest]
fn first_sighting_is_an_addition(harness: Harness) {
    let report = harness.export(&modified(1, 1));
    assert_eq!(report.changes.len(), 1);
    let change = &report.changes[0];
    assert_eq!(change.classification, Classification::Add);
    assert!(change.content.is_some());
    let record = ExportedFeatureStore::new(&harness.store)
        .get(ObjectKey::new(SPEED_LIMIT, 1))
        .expect("read record")
        .expect("record stored");
    assert_eq!(Some(record.content_hash), change.content_hash);
}

#[rstest]
fn rerunning_on_unchanged_content_emits_nothing(harness: Harness) {
    harness.export(&modified(1, 1));
    let report = harness.export(&modified(1, 1));
    assert!(report.changes.is_empty());
    assert_eq!(report.unchanged, vec![ObjectKey::new(SPEED_LIMIT, 1)]);
    assert!(report.bookkeeping.is_empty());
}

#[rstest]
fn a_new_version_with_identical_content_is_unchanged(harness: Harness) {
    harness.export(&modified(1, 1));
    seed_entities(&harness.store, &[], &[sample_object(1, 2, 42, 80)]).expect("bump version");
    let report = harness.export(&modified(1, 2));
    assert!(report.changes.is_empty());
}

#[rstest]
fn changed_properties_are_modifications(harness: Harness) {
    harness.export(&modified(1, 1));
    seed_entities(&harness.store, &[], &[sample_object(1, 2, 42, 50)]).expect("update object");
    let report = harness.export(&modified(1, 2));
    assert_eq!(
        report.changes.iter().map(|c| c.classification).collect::<Vec<_>>(),
        vec![Classification::Modify]
    );
}

#[rstest]
fn deletions_remove_the_record(harness: Harness) {
    harness.export(&modified(1, 1));
    let deleted = BTreeMap::from([(1, DirtyObjectChange::deleted(1, fixture_time()))]);
    let report = harness.export(&deleted);
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes[0].classification, Classification::Remove);
    assert!(report.changes[0].content.is_none());
    assert!(
        ExportedFeatureStore::new(&harness.store)
            .get(ObjectKey::new(SPEED_LIMIT, 1))
            .expect("read record")
            .is_none()
    );
}

#[rstest]
fn missing_required_property_is_a_removal(harness: Harness) {
    harness.export(&modified(1, 1));
    let mut object = sample_object(1, 2, 42, 80);
    object.properties.clear();
    object
        .properties
        .insert("note".to_owned(), crate::PropertyValue::Text("x".to_owned()));
    seed_entities(&harness.store, &[], &[object]).expect("update object");
    let report = harness.export(&modified(1, 2));
    assert_eq!(report.changes[0].classification, Classification::Remove);
}

#[rstest]
fn invalid_content_never_exported_is_suppressed(harness: Harness) {
    let mut object = sample_object(3, 1, 42, 80);
    object.locations.clear();
    seed_entities(&harness.store, &[], &[object]).expect("seed object");
    let report = harness.export(&modified(3, 1));
    assert!(report.changes.is_empty());
    assert_eq!(report.unchanged, vec![ObjectKey::new(SPEED_LIMIT, 3)]);
}

#[rstest]
fn dirty_sequences_pull_in_located_objects(harness: Harness) {
    harness.export(&modified(1, 1));
    let report = harness.diff(&BTreeMap::new(), &BTreeSet::from([42, 43]));
    // Object 2 was never exported, object 1 is unchanged.
    assert_eq!(
        report.changes.iter().map(|c| (c.key.id, c.classification)).collect::<Vec<_>>(),
        vec![(2, Classification::Add)]
    );
    assert_eq!(report.unchanged, vec![ObjectKey::new(SPEED_LIMIT, 1)]);
    assert!(report.sequences_settled());
}

#[rstest]
fn geometry_edits_on_a_sequence_modify_located_objects(harness: Harness) {
    harness.export(&modified(1, 1));
    let mut sequence = sample_sequence(42);
    sequence.links[0].geometry = sample_sequence(99).links[0].geometry.clone();
    seed_entities(&harness.store, &[sequence], &[]).expect("replace sequence");
    let report = harness.diff(&BTreeMap::new(), &BTreeSet::from([42]));
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes[0].classification, Classification::Modify);
}

#[rstest]
fn unreadable_objects_are_skipped_and_not_acknowledged(harness: Harness) {
    harness
        .store
        .put(
            Namespace::RoadObjects,
            object_key(ObjectKey::new(SPEED_LIMIT, 1)),
            b"corrupt".to_vec(),
        )
        .expect("corrupt object");
    let drained = BTreeMap::from([
        (1, DirtyObjectChange::modified(1, fixture_time())),
        (2, DirtyObjectChange::modified(1, fixture_time())),
    ]);
    let report = harness.diff(&drained, &BTreeSet::new());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].key, ObjectKey::new(SPEED_LIMIT, 1));
    assert_eq!(
        report.acknowledgeable(&drained).keys().copied().collect::<Vec<_>>(),
        vec![2]
    );
}

#[rstest]
fn skips_reached_through_sequences_keep_sequences_dirty(harness: Harness) {
    harness
        .store
        .put(
            Namespace::RoadObjects,
            object_key(ObjectKey::new(SPEED_LIMIT, 2)),
            b"corrupt".to_vec(),
        )
        .expect("corrupt object");
    let report = harness.diff(&BTreeMap::new(), &BTreeSet::from([43]));
    assert!(report.skipped[0].via_sequence);
    assert!(!report.sequences_settled());
}
