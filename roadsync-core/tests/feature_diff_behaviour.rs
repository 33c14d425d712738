//! Behavioural tests for the feature diff engine using rstest-bdd.

use std::{cell::RefCell, collections::BTreeMap, fs, path::PathBuf};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use roadsync_core::{
    ChangeLedger, Classification, ContentHash, DiffReport, DirtyObjectChange, ExportedFeatureStore,
    FeatureDiffEngine, FeatureRules, LinkGeometryEncoder, ObjectKey, StoreLookup,
    store::{MemoryStore, VersionedStore},
    test_support::{SPEED_LIMIT, fixture_time, sample_object, sample_sequence, seed_entities},
};

/// Shared state for diff scenarios.
struct DiffWorld {
    store: MemoryStore,
    rules: FeatureRules,
    first_hash: RefCell<Option<ContentHash>>,
    report: RefCell<Option<DiffReport>>,
}

impl DiffWorld {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            rules: FeatureRules::default().require(SPEED_LIMIT, ["speed"]),
            first_hash: RefCell::new(None),
            report: RefCell::new(None),
        }
    }

    /// Drain the ledger, diff, commit bookkeeping and acknowledge.
    fn run_cycle(&self) -> DiffReport {
        let ledger = ChangeLedger::new(&self.store);
        let objects = ledger
            .drain_dirty_object_changes(SPEED_LIMIT)
            .expect("drain objects");
        let sequences = ledger.drain_dirty_link_sequences().expect("drain sequences");
        let ids = sequences.keys().copied().collect();
        let lookup = StoreLookup::new(&self.store);
        let engine = FeatureDiffEngine::new(&self.store, &lookup, &LinkGeometryEncoder, &self.rules);
        let report = engine.diff(SPEED_LIMIT, &objects, &ids, fixture_time());

        let mut batch = report.bookkeeping.clone();
        ledger
            .stage_acknowledge_objects(&mut batch, SPEED_LIMIT, &report.acknowledgeable(&objects))
            .expect("acknowledge objects");
        if report.sequences_settled() {
            ledger
                .stage_acknowledge_link_sequences(&mut batch, &sequences)
                .expect("acknowledge sequences");
        }
        self.store.commit(batch).expect("commit cycle");
        report
    }

    fn stored_hash(&self, id: u64) -> Option<ContentHash> {
        ExportedFeatureStore::new(&self.store)
            .get(ObjectKey::new(SPEED_LIMIT, id))
            .expect("read exported record")
            .map(|record| record.content_hash)
    }
}

#[fixture]
fn world() -> DiffWorld {
    DiffWorld::new()
}

#[given("object {id} has been exported once")]
fn exported_once(world: &DiffWorld, id: u64) {
    seed_entities(&world.store, &[sample_sequence(42)], &[sample_object(id, 1, 42, 80)])
        .expect("seed entities");
    ChangeLedger::new(&world.store)
        .mark_objects_dirty(SPEED_LIMIT, [(id, DirtyObjectChange::modified(1, fixture_time()))])
        .expect("mark object");
    let report = world.run_cycle();
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes[0].classification, Classification::Add);
    world.first_hash.replace(world.stored_hash(id));
}

#[when("link sequence {id} is marked dirty without changing the object")]
fn touch_sequence(world: &DiffWorld, id: u64) {
    ChangeLedger::new(&world.store)
        .mark_link_sequences_dirty([id], fixture_time())
        .expect("mark sequence");
}

#[when("the properties of object {id} are cleared")]
fn clear_properties(world: &DiffWorld, id: u64) {
    let mut object = sample_object(id, 2, 42, 80);
    object.properties = BTreeMap::new();
    seed_entities(&world.store, &[], &[object]).expect("store cleared object");
    ChangeLedger::new(&world.store)
        .mark_objects_dirty(SPEED_LIMIT, [(id, DirtyObjectChange::modified(2, fixture_time()))])
        .expect("mark object");
}

#[when("the diff engine runs")]
fn run_diff(world: &DiffWorld) {
    let report = world.run_cycle();
    world.report.replace(Some(report));
}

#[then("no feature change is emitted")]
fn nothing_emitted(world: &DiffWorld) {
    let report = world.report.borrow();
    let report = report.as_ref().expect("diff should have run");
    assert!(report.changes.is_empty(), "unexpected changes: {:?}", report.changes);
}

#[then("the exported hash of object {id} is unchanged")]
fn hash_unchanged(world: &DiffWorld, id: u64) {
    assert!(world.first_hash.borrow().is_some());
    assert_eq!(world.stored_hash(id), *world.first_hash.borrow());
}

#[then("exactly one Remove change is emitted for object {id}")]
fn one_remove(world: &DiffWorld, id: u64) {
    let report = world.report.borrow();
    let report = report.as_ref().expect("diff should have run");
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes[0].key, ObjectKey::new(SPEED_LIMIT, id));
    assert_eq!(report.changes[0].classification, Classification::Remove);
}

#[then("no exported hash remains for object {id}")]
fn no_hash(world: &DiffWorld, id: u64) {
    assert_eq!(world.stored_hash(id), None);
    let ledger = ChangeLedger::new(&world.store);
    assert!(
        ledger
            .drain_dirty_object_changes(SPEED_LIMIT)
            .expect("drain")
            .is_empty()
    );
}

#[scenario(path = "tests/features/feature_diff.feature", index = 0)]
fn unchanged_feature_suppressed(world: DiffWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/feature_diff.feature", index = 1)]
fn cleared_feature_removed(world: DiffWorld) {
    let _ = world;
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature_path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/features/feature_diff.feature");
    let contents = match fs::read_to_string(&feature_path) {
        Ok(data) => data,
        Err(err) => panic!("failed to read feature file {feature_path:?}: {err}"),
    };
    let titles: Vec<String> = contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scenario: "))
        .map(str::to_owned)
        .collect();
    assert_eq!(
        titles,
        [
            "an unchanged feature touched through its link sequence is suppressed",
            "clearing the properties of an exported feature removes it",
        ]
    );
}
