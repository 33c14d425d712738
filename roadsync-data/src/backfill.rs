//! One-time full load of link sequences and road objects.
//!
//! The id space of every stream is split into a fixed number of ranges.
//! Each range is paged from its last checkpoint; every page is committed
//! together with the advanced checkpoint, so a restart resumes exactly after
//! the last committed page and never revisits a completed range.
//!
//! Backfill writes no dirty marks. Once every range is complete the event
//! cursors are seeded from the time the run first started and the
//! completion marker is written in the same batch.

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt, stream};
use log::{debug, info};
use roadsync_core::store::{VersionedStore, WriteBatch};
use roadsync_core::{EntityStream, IdRange};

use crate::apply::{Applied, PageApplier, fetch_entities};
use crate::context::SyncContext;
use crate::error::BackfillError;
use crate::settings::{
    Checkpoint, load_backfill, load_checkpoint, load_cursor, stage_backfill_complete,
    stage_backfill_reset, stage_backfill_start, stage_checkpoint, stage_cursor,
};

/// Outcome of [`BackfillCoordinator::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Partitions fetched by this invocation.
    pub partitions_run: usize,
    /// Partitions skipped because an earlier invocation completed them.
    pub partitions_skipped: usize,
    /// Entities written to the store.
    pub entities_written: u64,
    /// The run stopped early because shutdown was requested.
    pub interrupted: bool,
    /// The store already held a completed backfill.
    pub already_complete: bool,
}

impl BackfillReport {
    /// Whether the backfill is complete after this invocation.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.already_complete || !self.interrupted
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionTask {
    stream: EntityStream,
    index: u32,
    range: IdRange,
    checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Copy, Default)]
struct PartitionOutcome {
    written: u64,
    completed: bool,
}

/// Drives the partitioned initial load.
pub struct BackfillCoordinator<S> {
    context: SyncContext<S>,
}

impl<S: VersionedStore + 'static> BackfillCoordinator<S> {
    /// Coordinate backfill within `context`.
    #[must_use]
    pub const fn new(context: SyncContext<S>) -> Self {
        Self { context }
    }

    /// Run every incomplete partition, at most `max_workers` at a time.
    ///
    /// # Errors
    ///
    /// Returns the first partition failure. Pages committed before the
    /// failure stay committed and are not fetched again on the next run.
    pub async fn run(&self) -> Result<BackfillReport, BackfillError> {
        let config = &self.context.config;
        config.validate()?;
        let store = &*self.context.store;

        let markers = load_backfill(store)?;
        if markers.complete {
            info!("backfill already complete, nothing to do");
            return Ok(BackfillReport {
                already_complete: true,
                ..BackfillReport::default()
            });
        }
        if let Some(recorded) = markers.partitions
            && recorded != config.partitions
        {
            return Err(BackfillError::PartitionMismatch {
                recorded,
                configured: config.partitions,
            });
        }
        let started_at = match markers.started_at {
            Some(started_at) => {
                info!("resuming backfill started at {started_at}");
                started_at
            }
            None => {
                let started_at = Utc::now();
                let mut batch = WriteBatch::new();
                stage_backfill_start(&mut batch, started_at, config.partitions)?;
                self.context.commit(batch).await?;
                info!(
                    "starting backfill with {} partitions per stream",
                    config.partitions
                );
                started_at
            }
        };

        let mut report = BackfillReport::default();
        let mut tasks = Vec::new();
        let ranges = IdRange::partition(config.id_space_end, config.partitions);
        for stream in EntityStream::for_types(&config.object_types) {
            for (index, range) in (0_u32..).zip(ranges.iter().copied()) {
                let checkpoint = load_checkpoint(store, stream, index)?;
                if checkpoint.complete {
                    debug!("{stream} partition {index} already complete");
                    report.partitions_skipped += 1;
                } else {
                    tasks.push(PartitionTask {
                        stream,
                        index,
                        range,
                        checkpoint,
                    });
                }
            }
        }

        let mut report = stream::iter(tasks)
            .map(|task| self.run_partition(task))
            .buffer_unordered(config.max_workers)
            .try_fold(report, |mut report, outcome| async move {
                report.partitions_run += 1;
                report.entities_written += outcome.written;
                report.interrupted |= !outcome.completed;
                Ok::<_, BackfillError>(report)
            })
            .await?;

        if report.interrupted {
            info!("backfill interrupted, {} entities written", report.entities_written);
            return Ok(report);
        }
        if self.context.is_shutting_down() {
            report.interrupted = true;
            return Ok(report);
        }
        self.finish(started_at).await?;
        info!(
            "backfill complete: {} partitions run, {} skipped, {} entities written",
            report.partitions_run, report.partitions_skipped, report.entities_written
        );
        Ok(report)
    }

    /// Forget every checkpoint and run marker so the next run starts over.
    ///
    /// Stored entities and event cursors are kept.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reset(&self) -> Result<(), BackfillError> {
        let mut batch = WriteBatch::new();
        stage_backfill_reset(&*self.context.store, &mut batch)?;
        self.context.commit(batch).await?;
        info!("backfill checkpoints cleared");
        Ok(())
    }

    async fn run_partition(&self, task: PartitionTask) -> Result<PartitionOutcome, BackfillError> {
        let PartitionTask {
            stream,
            index,
            range,
            checkpoint,
        } = task;
        let config = &self.context.config;
        let prune_before = (Utc::now() - config.link_retention).date_naive();
        let mut cursor = checkpoint.cursor;
        let mut outcome = PartitionOutcome::default();
        debug!("{stream} partition {index} fetching {range:?} after {cursor:?}");

        loop {
            if self.context.is_shutting_down() {
                debug!("{stream} partition {index} stopping for shutdown");
                return Ok(outcome);
            }
            let page = fetch_entities(
                self.context.source.as_ref(),
                stream,
                range,
                cursor,
                config.page_size,
            )
            .await
            .map_err(|source| BackfillError::Fetch {
                stream,
                partition: index,
                source,
            })?;
            if let (Some(next), Some(previous)) = (page.next_cursor, cursor)
                && next <= previous
            {
                return Err(BackfillError::StalledCursor {
                    stream,
                    partition: index,
                    cursor: next,
                });
            }

            let complete = page.next_cursor.is_none();
            let advanced = Checkpoint {
                cursor: page.next_cursor.or(cursor),
                complete,
            };
            let items = page.items;
            let written = self
                .context
                .write(move |store| {
                    let mut applier = PageApplier::for_backfill(store, prune_before);
                    let mut written = 0_u64;
                    for entity in items {
                        if applier.upsert(entity)? == Applied::Written {
                            written += 1;
                        }
                    }
                    stage_checkpoint(applier.batch_mut(), stream, index, advanced)?;
                    Ok((applier.finish()?, written))
                })
                .await?;
            outcome.written += written;

            if complete {
                info!(
                    "{stream} partition {index} complete, {} entities written",
                    outcome.written
                );
                outcome.completed = true;
                return Ok(outcome);
            }
            cursor = advanced.cursor;
        }
    }

    async fn finish(&self, started_at: DateTime<Utc>) -> Result<(), BackfillError> {
        let store = &*self.context.store;
        let mut batch = WriteBatch::new();
        for stream in EntityStream::for_types(&self.context.config.object_types) {
            if load_cursor(store, stream)?.is_some() {
                continue;
            }
            let cursor = self
                .context
                .source
                .latest_event_id(stream, started_at)
                .await
                .map_err(|source| BackfillError::SeedCursor { stream, source })?;
            debug!("seeding {stream} event cursor at {cursor}");
            stage_cursor(&mut batch, stream, cursor)?;
        }
        stage_backfill_complete(&mut batch)?;
        self.context.commit(batch).await?;
        Ok(())
    }
}
