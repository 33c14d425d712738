//! Drain, diff, export and acknowledge.
//!
//! The ledger and the exported-feature records only change after the
//! exporter has accepted the batch, and then in a single commit. A crash
//! between the hand-off and that commit re-exports the same changes on the
//! next cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use roadsync_core::store::keys::{decode_object_key, type_prefix};
use roadsync_core::store::{Namespace, StoreError, StoreExt, VersionedStore, WriteBatch};
use roadsync_core::{
    ChangeBatch, ChangeLedger, Classification, DiffReport, DirtyObjectChange,
    ExportedFeatureStore, FeatureDiffEngine, FeatureExporter, FeatureRules, LocationEncoder,
    ObjectMarks, RoadObject, StoreLookup, TypeId,
};

use crate::context::SyncContext;
use crate::error::{CommitError, ExportCycleError};
use crate::settings::{is_backfill_complete, is_baseline_marked, stage_baseline_marked};

/// Outcome of [`ExportCycle::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Features emitted as additions.
    pub added: usize,
    /// Features emitted as modifications.
    pub modified: usize,
    /// Features emitted as removals.
    pub removed: usize,
    /// Dirty features whose content matched the last export.
    pub unchanged: usize,
    /// Features left dirty because they could not be rebuilt.
    pub skipped: usize,
}

impl ExportReport {
    /// Number of features handed to the exporter.
    #[must_use]
    pub const fn emitted(&self) -> usize {
        self.added + self.modified + self.removed
    }
}

struct TypePlan {
    type_id: TypeId,
    drained: BTreeMap<u64, DirtyObjectChange>,
    report: DiffReport,
}

struct Plan {
    types: Vec<TypePlan>,
    sequences: BTreeMap<u64, DateTime<Utc>>,
}

impl Plan {
    fn sequences_settled(&self) -> bool {
        self.types.iter().all(|plan| plan.report.sequences_settled())
    }
}

/// One export cycle over the configured object types.
pub struct ExportCycle<S> {
    context: SyncContext<S>,
    exporter: Arc<dyn FeatureExporter>,
    encoder: Arc<dyn LocationEncoder>,
}

impl<S: VersionedStore + 'static> ExportCycle<S> {
    /// Export through `exporter`, encoding locations with `encoder`.
    #[must_use]
    pub fn new(
        context: SyncContext<S>,
        exporter: Arc<dyn FeatureExporter>,
        encoder: Arc<dyn LocationEncoder>,
    ) -> Self {
        Self {
            context,
            exporter,
            encoder,
        }
    }

    /// Mark every stored object without an exported record dirty, once per
    /// completed backfill.
    ///
    /// Returns the number of objects marked; zero when the baseline has
    /// already been marked or the backfill is incomplete.
    ///
    /// # Errors
    ///
    /// Propagates scan and commit failures.
    pub async fn mark_baseline(&self) -> Result<usize, ExportCycleError> {
        let store = Arc::clone(&self.context.store);
        let types = self.context.config.object_types.clone();
        let chunk = self.context.config.page_size;
        let marked = tokio::task::spawn_blocking(move || mark_unexported(&*store, &types, chunk))
            .await
            .map_err(CommitError::from)??;
        if marked > 0 {
            info!("marked {marked} never-exported objects dirty");
        }
        Ok(marked)
    }

    /// Run one cycle at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportCycleError`] when draining, exporting or committing
    /// fails. The ledger is unchanged in every error case.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ExportReport, ExportCycleError> {
        let store = Arc::clone(&self.context.store);
        let config = Arc::clone(&self.context.config);
        let encoder = Arc::clone(&self.encoder);
        let plan = tokio::task::spawn_blocking(move || {
            plan_cycle(&*store, encoder.as_ref(), &config.object_types, &config.rules, now)
        })
        .await
        .map_err(CommitError::from)??;

        let mut report = ExportReport::default();
        let mut changes = Vec::new();
        for type_plan in &plan.types {
            report.unchanged += type_plan.report.unchanged.len();
            report.skipped += type_plan.report.skipped.len();
            for skipped in &type_plan.report.skipped {
                warn!("feature {} left dirty: {}", skipped.key, skipped.reason);
            }
            changes.extend(type_plan.report.changes.iter().cloned());
        }
        let batch = ChangeBatch {
            generated_at: now,
            changes,
        };
        report.added = batch.count(Classification::Add);
        report.modified = batch.count(Classification::Modify);
        report.removed = batch.count(Classification::Remove);

        if !batch.changes.is_empty() {
            self.exporter.export(&batch).await?;
        }

        let store = Arc::clone(&self.context.store);
        tokio::task::spawn_blocking(move || acknowledge(&*store, plan))
            .await
            .map_err(CommitError::from)?
            .map_err(CommitError::from)?;
        info!(
            "export cycle: {} added, {} modified, {} removed, {} unchanged, {} skipped",
            report.added, report.modified, report.removed, report.unchanged, report.skipped
        );
        Ok(report)
    }
}

fn plan_cycle<S: VersionedStore + ?Sized>(
    store: &S,
    encoder: &dyn LocationEncoder,
    types: &[TypeId],
    rules: &FeatureRules,
    now: DateTime<Utc>,
) -> Result<Plan, StoreError> {
    let ledger = ChangeLedger::new(store);
    let sequences = ledger.drain_dirty_link_sequences()?;
    let sequence_ids: BTreeSet<u64> = sequences.keys().copied().collect();
    let lookup = StoreLookup::new(store);
    let engine = FeatureDiffEngine::new(store, &lookup, encoder, rules);
    let mut plans = Vec::with_capacity(types.len());
    for &type_id in types {
        let drained = ledger.drain_dirty_object_changes(type_id)?;
        let report = engine.diff(type_id, &drained, &sequence_ids, now);
        plans.push(TypePlan {
            type_id,
            drained,
            report,
        });
    }
    Ok(Plan {
        types: plans,
        sequences,
    })
}

fn acknowledge<S: VersionedStore + ?Sized>(store: &S, plan: Plan) -> Result<(), StoreError> {
    let ledger = ChangeLedger::new(store);
    let settled = plan.sequences_settled();
    let mut batch = WriteBatch::new();
    for type_plan in plan.types {
        let acknowledged = type_plan.report.acknowledgeable(&type_plan.drained);
        ledger.stage_acknowledge_objects(&mut batch, type_plan.type_id, &acknowledged)?;
        batch.extend(type_plan.report.bookkeeping);
    }
    if settled {
        ledger.stage_acknowledge_link_sequences(&mut batch, &plan.sequences)?;
    }
    store.commit(batch)
}

fn mark_unexported<S: VersionedStore + ?Sized>(
    store: &S,
    types: &[TypeId],
    chunk: usize,
) -> Result<usize, StoreError> {
    if !is_backfill_complete(store)? || is_baseline_marked(store)? {
        return Ok(0);
    }
    let ledger = ChangeLedger::new(store);
    let exported = ExportedFeatureStore::new(store);
    let now = Utc::now();
    let mut marked = 0;
    let mut marks = ObjectMarks::default();
    for &type_id in types {
        for entry in store.iter_prefix(Namespace::RoadObjects, &type_prefix(type_id)) {
            let entry = entry?;
            let Some(key) = decode_object_key(&entry.key) else {
                continue;
            };
            let version = match serde_json::from_slice::<RoadObject>(&entry.value) {
                Ok(object) => object.version,
                Err(err) => {
                    warn!("object {key} is undecodable, marking it for retry: {err}");
                    0
                }
            };
            if exported.get(key)?.is_none() {
                marks.record(key, DirtyObjectChange::modified(version, now));
                marked += 1;
            }
            if marks.len() >= chunk {
                let mut batch = WriteBatch::new();
                ledger.stage_object_marks(&mut batch, std::mem::take(&mut marks))?;
                store.commit(batch)?;
            }
        }
    }
    let mut batch = WriteBatch::new();
    ledger.stage_object_marks(&mut batch, marks)?;
    stage_baseline_marked(&mut batch)?;
    store.commit(batch)?;
    Ok(marked)
}

#[cfg(test)]
mod tests {
    use super::*;

    use roadsync_core::store::MemoryStore;
    use roadsync_core::test_support::{
        SPEED_LIMIT, fixture_time, sample_object, sample_sequence, seed_entities,
    };
    use roadsync_core::{LinkGeometryEncoder, ObjectKey};
    use rstest::{fixture, rstest};

    use crate::config::SyncConfig;
    use crate::settings::stage_backfill_complete;
    use crate::test_support::{RecordingExporter, StubSource, block_on_for_tests};

    struct Harness {
        exporter: Arc<RecordingExporter>,
        cycle: ExportCycle<MemoryStore>,
    }

    impl Harness {
        fn store(&self) -> &MemoryStore {
            &self.cycle.context.store
        }

        fn mark(&self, ids: &[u64]) {
            ChangeLedger::new(self.store())
                .mark_objects_dirty(
                    SPEED_LIMIT,
                    ids.iter()
                        .map(|&id| (id, DirtyObjectChange::modified(1, fixture_time()))),
                )
                .expect("mark dirty");
        }

        fn run(&self) -> ExportReport {
            block_on_for_tests(self.cycle.run(fixture_time())).expect("cycle succeeds")
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        seed_entities(
            &*store,
            &[sample_sequence(42)],
            &[sample_object(1, 1, 42, 80), sample_object(2, 1, 42, 60)],
        )
        .expect("seed entities");
        let config = SyncConfig::default()
            .with_object_types([SPEED_LIMIT])
            .with_rules(FeatureRules::default().require(SPEED_LIMIT, ["speed"]));
        let context = SyncContext::new(store, Arc::new(StubSource::default()), config);
        let exporter = Arc::new(RecordingExporter::default());
        let cycle = ExportCycle::new(
            context,
            Arc::clone(&exporter) as _,
            Arc::new(LinkGeometryEncoder),
        );
        Harness { exporter, cycle }
    }

    #[rstest]
    fn exported_changes_are_acknowledged(harness: Harness) {
        harness.mark(&[1, 2]);

        let report = harness.run();

        assert_eq!(report.added, 2);
        assert_eq!(harness.exporter.batches().len(), 1);
        assert!(
            ChangeLedger::new(harness.store())
                .pending(&[SPEED_LIMIT])
                .expect("pending")
                .is_empty()
        );
    }

    #[rstest]
    fn reexporting_unchanged_content_calls_no_exporter(harness: Harness) {
        harness.mark(&[1]);
        harness.run();
        harness.mark(&[1]);

        let report = harness.run();

        assert_eq!(report.emitted(), 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(harness.exporter.batches().len(), 1);
        assert!(
            ChangeLedger::new(harness.store())
                .pending(&[SPEED_LIMIT])
                .expect("pending")
                .is_empty()
        );
    }

    #[rstest]
    fn rejected_exports_leave_the_ledger_dirty(harness: Harness) {
        harness.mark(&[1]);
        harness.exporter.reject_next();

        let err = block_on_for_tests(harness.cycle.run(fixture_time()))
            .expect_err("exporter rejects");

        assert!(matches!(err, ExportCycleError::Export(_)));
        assert_eq!(
            ChangeLedger::new(harness.store())
                .pending(&[SPEED_LIMIT])
                .expect("pending")
                .len(),
            1
        );
        assert!(
            ExportedFeatureStore::new(harness.store())
                .get(ObjectKey::new(SPEED_LIMIT, 1))
                .expect("read record")
                .is_none()
        );
        assert_eq!(harness.run().added, 1);
    }

    #[rstest]
    fn baseline_marks_never_exported_objects_once(harness: Harness) {
        assert_eq!(
            block_on_for_tests(harness.cycle.mark_baseline()).expect("no backfill yet"),
            0
        );
        let mut batch = WriteBatch::new();
        stage_backfill_complete(&mut batch).expect("stage marker");
        harness.store().commit(batch).expect("commit marker");

        let marked = block_on_for_tests(harness.cycle.mark_baseline()).expect("mark baseline");

        assert_eq!(marked, 2);
        assert_eq!(harness.run().added, 2);
        assert_eq!(
            block_on_for_tests(harness.cycle.mark_baseline()).expect("already marked"),
            0
        );
    }
}
