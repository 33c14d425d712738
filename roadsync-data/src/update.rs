//! Steady-state incremental sync driven by the source's event streams.
//!
//! A cycle polls every stream concurrently. Each stream snapshots the
//! latest event id at the start of its pass and pages from its stored
//! cursor up to that target; every page is committed together with the
//! advanced cursor and the dirty marks of the entities it touched. Passes
//! repeat until one consumes no events.

use std::fmt;

use chrono::Utc;
use futures_util::future::try_join_all;
use log::{debug, info};
use parking_lot::Mutex;
use roadsync_core::EntityStream;
use roadsync_core::store::{VersionedStore, WriteBatch};

use crate::apply::{Applied, PageApplier, fetch_events};
use crate::context::SyncContext;
use crate::error::UpdateError;
use crate::settings::{load_cursor, stage_cursor};

/// Phase of an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Fetching event pages.
    Polling,
    /// Committing fetched changes.
    Applying,
    /// A pass consumed no events.
    Converged,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Polling => "polling",
            Self::Applying => "applying",
            Self::Converged => "converged",
        })
    }
}

/// Outcome of [`UpdateCoordinator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    /// Passes run, including the final empty one.
    pub passes: u32,
    /// Events consumed across every pass.
    pub total_changes: u64,
    /// Entities whose stored state changed.
    pub entities_written: u64,
    /// The cycle stopped early because shutdown was requested.
    pub interrupted: bool,
    /// Phase the coordinator ended in.
    pub state: SyncState,
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamPass {
    events: u64,
    written: u64,
    interrupted: bool,
}

/// Drives update cycles to a fixed point.
pub struct UpdateCoordinator<S> {
    context: SyncContext<S>,
    state: Mutex<SyncState>,
}

impl<S: VersionedStore + 'static> UpdateCoordinator<S> {
    /// Coordinate updates within `context`.
    #[must_use]
    pub fn new(context: SyncContext<S>) -> Self {
        Self {
            context,
            state: Mutex::new(SyncState::Converged),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    fn transition(&self, next: SyncState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!("update cycle {} -> {next}", *state);
            *state = next;
        }
    }

    /// Poll every stream until a pass consumes no events.
    ///
    /// Streams without a cursor are seeded at the current latest event.
    ///
    /// # Errors
    ///
    /// Returns the first stream failure. Pages committed before the failure
    /// stay committed together with their cursors.
    pub async fn run(&self) -> Result<UpdateReport, UpdateError> {
        self.context.config.validate()?;
        let streams = EntityStream::for_types(&self.context.config.object_types);
        self.seed_cursors(&streams).await?;

        let mut report = UpdateReport {
            passes: 0,
            total_changes: 0,
            entities_written: 0,
            interrupted: false,
            state: SyncState::Polling,
        };
        loop {
            if self.context.is_shutting_down() {
                report.interrupted = true;
                break;
            }
            self.transition(SyncState::Polling);
            let passes = try_join_all(streams.iter().map(|&stream| self.poll_stream(stream))).await?;
            report.passes += 1;
            let events: u64 = passes.iter().map(|pass| pass.events).sum();
            report.total_changes += events;
            report.entities_written += passes.iter().map(|pass| pass.written).sum::<u64>();
            debug!("update pass {} consumed {events} events", report.passes);
            if passes.iter().any(|pass| pass.interrupted) {
                report.interrupted = true;
                break;
            }
            if events == 0 {
                self.transition(SyncState::Converged);
                break;
            }
        }
        report.state = self.state();
        info!(
            "update cycle {}: {} changes over {} passes",
            if report.interrupted { "interrupted" } else { "converged" },
            report.total_changes,
            report.passes
        );
        Ok(report)
    }

    async fn seed_cursors(&self, streams: &[EntityStream]) -> Result<(), UpdateError> {
        let mut batch = WriteBatch::new();
        for &stream in streams {
            if load_cursor(&*self.context.store, stream)?.is_some() {
                continue;
            }
            let cursor = self
                .context
                .source
                .latest_event_id(stream, Utc::now())
                .await
                .map_err(|source| UpdateError::Fetch { stream, source })?;
            info!("seeding {stream} event cursor at {cursor}");
            stage_cursor(&mut batch, stream, cursor)?;
        }
        self.context.commit(batch).await?;
        Ok(())
    }

    async fn poll_stream(&self, stream: EntityStream) -> Result<StreamPass, UpdateError> {
        let config = &self.context.config;
        let mut cursor = load_cursor(&*self.context.store, stream)?.unwrap_or_default();
        let target = self
            .context
            .source
            .latest_event_id(stream, Utc::now())
            .await
            .map_err(|source| UpdateError::Fetch { stream, source })?;
        let mut pass = StreamPass::default();

        while cursor < target {
            if self.context.is_shutting_down() {
                pass.interrupted = true;
                break;
            }
            let page = fetch_events(self.context.source.as_ref(), stream, cursor, config.page_size)
                .await
                .map_err(|source| UpdateError::Fetch { stream, source })?;
            let advanced = page.next_cursor.min(target).max(cursor);
            let events: Vec<_> = page
                .events
                .into_iter()
                .filter(|event| event.event_id > cursor && event.event_id <= advanced)
                .collect();
            if advanced == cursor {
                debug!("{stream} has no events past {cursor} yet, target {target}");
                break;
            }

            self.transition(SyncState::Applying);
            let consumed = events.len() as u64;
            let now = Utc::now();
            let prune_before = (now - config.link_retention).date_naive();
            let written = self
                .context
                .write(move |store| {
                    let mut applier = PageApplier::for_update(store, prune_before, now);
                    let mut written = 0_u64;
                    for event in events {
                        if applier.apply_change(stream, event.change)? == Applied::Written {
                            written += 1;
                        }
                    }
                    stage_cursor(applier.batch_mut(), stream, advanced)?;
                    Ok((applier.finish()?, written))
                })
                .await?;
            debug!("{stream} applied {consumed} events up to {advanced}");
            pass.events += consumed;
            pass.written += written;
            cursor = advanced;
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use roadsync_core::store::MemoryStore;
    use roadsync_core::test_support::{SPEED_LIMIT, sample_object, sample_sequence, seed_entities};
    use roadsync_core::{ChangeKind, ChangeLedger, EntityLookup, ObjectKey, StoreLookup};
    use rstest::{fixture, rstest};

    use crate::config::SyncConfig;
    use crate::test_support::{StubEvent, StubSource, block_on_for_tests};

    struct Harness {
        stub: Arc<StubSource>,
        update: UpdateCoordinator<MemoryStore>,
    }

    impl Harness {
        fn store(&self) -> &MemoryStore {
            &self.update.context.store
        }

        fn run(&self) -> UpdateReport {
            block_on_for_tests(self.update.run()).expect("update succeeds")
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let stub = Arc::new(StubSource::default());
        let store = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        for stream in EntityStream::for_types(&[SPEED_LIMIT]) {
            stage_cursor(&mut batch, stream, 0).expect("stage cursor");
        }
        store.commit(batch).expect("seed cursors");
        let config = SyncConfig::default()
            .with_object_types([SPEED_LIMIT])
            .with_page_size(2);
        let update =
            UpdateCoordinator::new(SyncContext::new(store, Arc::clone(&stub) as _, config));
        Harness { stub, update }
    }

    #[rstest]
    fn no_events_converge_after_one_pass(harness: Harness) {
        let report = harness.run();
        assert_eq!(report.passes, 1);
        assert_eq!(report.total_changes, 0);
        assert_eq!(report.state, SyncState::Converged);
    }

    #[rstest]
    fn applied_changes_are_marked_dirty(harness: Harness) {
        harness.stub.push_wave([
            StubEvent::UpsertSequence(sample_sequence(42)),
            StubEvent::UpsertObject(sample_object(1, 1, 42, 80)),
            StubEvent::UpsertObject(sample_object(2, 1, 42, 60)),
        ]);

        let report = harness.run();

        assert_eq!(report.total_changes, 3);
        assert_eq!(report.entities_written, 3);
        let ledger = ChangeLedger::new(harness.store());
        let drained = ledger
            .drain_dirty_object_changes(SPEED_LIMIT)
            .expect("drain objects");
        assert_eq!(drained.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            ledger
                .drain_dirty_link_sequence_ids()
                .expect("drain sequences")
                .into_iter()
                .collect::<Vec<_>>(),
            vec![42]
        );
    }

    #[rstest]
    fn older_versions_do_not_overwrite_newer_ones(harness: Harness) {
        seed_entities(harness.store(), &[], &[sample_object(1, 3, 42, 80)]).expect("seed");
        harness
            .stub
            .push_wave([StubEvent::UpsertObject(sample_object(1, 2, 42, 30))]);

        let report = harness.run();

        assert_eq!(report.total_changes, 1);
        assert_eq!(report.entities_written, 0);
        let ledger = ChangeLedger::new(harness.store());
        assert!(
            ledger
                .drain_dirty_object_changes(SPEED_LIMIT)
                .expect("drain")
                .is_empty()
        );
    }

    #[rstest]
    #[case(&[1, 2])]
    #[case(&[2, 1])]
    fn removals_resolve_to_deleted_in_any_order(harness: Harness, #[case] versions: &[u32]) {
        seed_entities(harness.store(), &[], &[sample_object(7, 2, 42, 80)]).expect("seed");
        harness.stub.push_wave(versions.iter().map(|&version| StubEvent::RemoveObject {
            type_id: SPEED_LIMIT,
            id: 7,
            version: Some(version),
        }));

        harness.run();

        let drained = ChangeLedger::new(harness.store())
            .drain_dirty_object_changes(SPEED_LIMIT)
            .expect("drain");
        assert_eq!(drained.get(&7).map(|change| change.kind), Some(ChangeKind::Deleted));
        assert!(
            StoreLookup::new(harness.store())
                .road_object(ObjectKey::new(SPEED_LIMIT, 7))
                .expect("lookup")
                .is_none()
        );
    }

    #[rstest]
    fn trailing_waves_need_further_passes(harness: Harness) {
        harness
            .stub
            .push_wave([StubEvent::UpsertObject(sample_object(1, 1, 42, 80))]);
        harness.stub.push_wave([
            StubEvent::UpsertObject(sample_object(1, 2, 42, 50)),
            StubEvent::UpsertObject(sample_object(2, 1, 42, 50)),
        ]);

        let report = harness.run();

        assert_eq!(report.passes, 3);
        assert_eq!(report.total_changes, 3);
        assert_eq!(report.state, SyncState::Converged);
    }

    #[rstest]
    fn unseeded_cursors_start_at_the_latest_event() {
        let stub = Arc::new(StubSource::default());
        stub.push_wave([StubEvent::UpsertObject(sample_object(1, 1, 42, 80))]);
        let config = SyncConfig::default().with_object_types([SPEED_LIMIT]);
        let update = UpdateCoordinator::new(SyncContext::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&stub) as _,
            config,
        ));

        let report = block_on_for_tests(update.run()).expect("update succeeds");

        assert_eq!(report.total_changes, 0);
        assert_eq!(
            load_cursor(&*update.context.store, EntityStream::Objects(SPEED_LIMIT))
                .expect("read cursor"),
            Some(1)
        );
    }
}
