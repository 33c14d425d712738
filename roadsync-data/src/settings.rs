//! Backfill checkpoints, run markers and event cursors kept in `Settings`.

use chrono::{DateTime, Utc};
use roadsync_core::EntityStream;
use roadsync_core::store::keys::{
    CheckpointMarker, checkpoint_key, checkpoint_prefix, cursor_key, setting_key,
};
use roadsync_core::store::{Namespace, StoreError, StoreExt, VersionedStore, WriteBatch};

const STARTED_AT: &str = "backfill/started_at";
const PARTITIONS: &str = "backfill/partitions";
const COMPLETE: &str = "backfill/complete";
const BASELINE: &str = "backfill/baseline_marked";

/// Progress of one backfill partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last id applied, if any.
    pub cursor: Option<u64>,
    /// Whether the partition's range is exhausted.
    pub complete: bool,
}

/// Run-level backfill markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillMarkers {
    /// When the current run first started.
    pub started_at: Option<DateTime<Utc>>,
    /// Partition count the run was started with.
    pub partitions: Option<u32>,
    /// Whether every partition finished and cursors were seeded.
    pub complete: bool,
}

/// Read the checkpoint of `stream` partition `partition`.
///
/// # Errors
///
/// Propagates read and decode failures.
pub fn load_checkpoint<S: VersionedStore + ?Sized>(
    store: &S,
    stream: EntityStream,
    partition: u32,
) -> Result<Checkpoint, StoreError> {
    let cursor = store.get_json(
        Namespace::Settings,
        &checkpoint_key(stream, partition, CheckpointMarker::Cursor),
    )?;
    let complete = store
        .get_json(
            Namespace::Settings,
            &checkpoint_key(stream, partition, CheckpointMarker::Complete),
        )?
        .unwrap_or(false);
    Ok(Checkpoint { cursor, complete })
}

/// Stage `checkpoint` for `stream` partition `partition`.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if a value cannot be serialised.
pub fn stage_checkpoint(
    batch: &mut WriteBatch,
    stream: EntityStream,
    partition: u32,
    checkpoint: Checkpoint,
) -> Result<(), StoreError> {
    if let Some(cursor) = checkpoint.cursor {
        batch.put_json(
            Namespace::Settings,
            checkpoint_key(stream, partition, CheckpointMarker::Cursor),
            &cursor,
        )?;
    }
    batch.put_json(
        Namespace::Settings,
        checkpoint_key(stream, partition, CheckpointMarker::Complete),
        &checkpoint.complete,
    )
}

/// Read the run markers.
///
/// # Errors
///
/// Propagates read and decode failures.
pub fn load_backfill<S: VersionedStore + ?Sized>(store: &S) -> Result<BackfillMarkers, StoreError> {
    Ok(BackfillMarkers {
        started_at: store.get_json(Namespace::Settings, &setting_key(STARTED_AT))?,
        partitions: store.get_json(Namespace::Settings, &setting_key(PARTITIONS))?,
        complete: store
            .get_json(Namespace::Settings, &setting_key(COMPLETE))?
            .unwrap_or(false),
    })
}

/// Whether a backfill has completed in this store.
///
/// # Errors
///
/// Propagates read and decode failures.
pub fn is_backfill_complete<S: VersionedStore + ?Sized>(store: &S) -> Result<bool, StoreError> {
    Ok(load_backfill(store)?.complete)
}

/// Stage the start markers of a new run.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if a value cannot be serialised.
pub fn stage_backfill_start(
    batch: &mut WriteBatch,
    started_at: DateTime<Utc>,
    partitions: u32,
) -> Result<(), StoreError> {
    batch.put_json(Namespace::Settings, setting_key(STARTED_AT), &started_at)?;
    batch.put_json(Namespace::Settings, setting_key(PARTITIONS), &partitions)
}

/// Stage the completion marker.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if the value cannot be serialised.
pub fn stage_backfill_complete(batch: &mut WriteBatch) -> Result<(), StoreError> {
    batch.put_json(Namespace::Settings, setting_key(COMPLETE), &true)
}

/// Whether the post-backfill export baseline has been marked dirty.
///
/// # Errors
///
/// Propagates read and decode failures.
pub fn is_baseline_marked<S: VersionedStore + ?Sized>(store: &S) -> Result<bool, StoreError> {
    Ok(store
        .get_json(Namespace::Settings, &setting_key(BASELINE))?
        .unwrap_or(false))
}

/// Stage the baseline marker.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if the value cannot be serialised.
pub fn stage_baseline_marked(batch: &mut WriteBatch) -> Result<(), StoreError> {
    batch.put_json(Namespace::Settings, setting_key(BASELINE), &true)
}

/// Stage deletion of every checkpoint and run marker.
///
/// # Errors
///
/// Propagates scan failures.
pub fn stage_backfill_reset<S: VersionedStore + ?Sized>(
    store: &S,
    batch: &mut WriteBatch,
) -> Result<(), StoreError> {
    for entry in store.iter_prefix(Namespace::Settings, &checkpoint_prefix()) {
        batch.delete(Namespace::Settings, entry?.key);
    }
    Ok(())
}

/// Read the event cursor of `stream`.
///
/// # Errors
///
/// Propagates read and decode failures.
pub fn load_cursor<S: VersionedStore + ?Sized>(
    store: &S,
    stream: EntityStream,
) -> Result<Option<u64>, StoreError> {
    store.get_json(Namespace::Settings, &cursor_key(stream))
}

/// Stage the event cursor of `stream`.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if the value cannot be serialised.
pub fn stage_cursor(
    batch: &mut WriteBatch,
    stream: EntityStream,
    cursor: u64,
) -> Result<(), StoreError> {
    batch.put_json(Namespace::Settings, cursor_key(stream), &cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use roadsync_core::store::MemoryStore;
    use rstest::rstest;

    #[rstest]
    fn checkpoints_round_trip_per_partition() {
        let store = MemoryStore::new();
        let stream = EntityStream::Objects(105);
        let mut batch = WriteBatch::new();
        stage_checkpoint(
            &mut batch,
            stream,
            2,
            Checkpoint {
                cursor: Some(40),
                complete: false,
            },
        )
        .expect("stage checkpoint");
        store.commit(batch).expect("commit");

        assert_eq!(
            load_checkpoint(&store, stream, 2).expect("load"),
            Checkpoint {
                cursor: Some(40),
                complete: false
            }
        );
        assert_eq!(
            load_checkpoint(&store, stream, 1).expect("load"),
            Checkpoint::default()
        );
    }

    #[rstest]
    fn reset_clears_run_markers_but_keeps_cursors() {
        let store = MemoryStore::new();
        let started = Utc
            .with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");
        let mut batch = WriteBatch::new();
        stage_backfill_start(&mut batch, started, 4).expect("stage start");
        stage_backfill_complete(&mut batch).expect("stage complete");
        stage_baseline_marked(&mut batch).expect("stage baseline");
        stage_cursor(&mut batch, EntityStream::LinkSequences, 17).expect("stage cursor");
        store.commit(batch).expect("commit");
        assert_eq!(
            load_backfill(&store).expect("load"),
            BackfillMarkers {
                started_at: Some(started),
                partitions: Some(4),
                complete: true
            }
        );

        let mut reset = WriteBatch::new();
        stage_backfill_reset(&store, &mut reset).expect("stage reset");
        store.commit(reset).expect("commit reset");

        assert_eq!(load_backfill(&store).expect("load"), BackfillMarkers::default());
        assert!(!is_baseline_marked(&store).expect("load baseline"));
        assert_eq!(
            load_cursor(&store, EntityStream::LinkSequences).expect("load cursor"),
            Some(17)
        );
    }
}
