//! Version-checked application of fetched entities to one write batch.
//!
//! A [`PageApplier`] is owned by a single task for the lifetime of one page.
//! It keeps an overlay of what the page has already written so later items
//! of the same page are checked against the pending state rather than the
//! committed one.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use log::warn;
use roadsync_core::entities::{
    stage_put_object, stage_put_sequence, stage_remove_object, stage_remove_sequence,
};
use roadsync_core::store::keys::{object_key, sequence_key};
use roadsync_core::store::{Namespace, StoreError, StoreExt, VersionedStore, WriteBatch};
use roadsync_core::{
    Change, ChangeEvent, ChangeLedger, DirtyObjectChange, EntityPage, EntityStream, EventPage,
    IdRange, ObjectKey, ObjectMarks, RoadDataSource, RoadLinkSequence, RoadObject, SourceError,
};

/// An entity of any stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entity {
    Sequence(RoadLinkSequence),
    Object(RoadObject),
}

impl From<RoadLinkSequence> for Entity {
    fn from(sequence: RoadLinkSequence) -> Self {
        Self::Sequence(sequence)
    }
}

impl From<RoadObject> for Entity {
    fn from(object: RoadObject) -> Self {
        Self::Object(object)
    }
}

fn widen_page<T: Into<Entity>>(page: EntityPage<T>) -> EntityPage<Entity> {
    EntityPage {
        items: page.items.into_iter().map(Into::into).collect(),
        next_cursor: page.next_cursor,
    }
}

fn widen_events<T: Into<Entity>>(page: EventPage<T>) -> EventPage<Entity> {
    EventPage {
        events: page
            .events
            .into_iter()
            .map(|event| ChangeEvent {
                event_id: event.event_id,
                change: match event.change {
                    Change::Upsert(entity) => Change::Upsert(entity.into()),
                    Change::Remove { id, version } => Change::Remove { id, version },
                },
            })
            .collect(),
        next_cursor: page.next_cursor,
    }
}

/// Fetch one page of `stream` entities in `range`.
pub(crate) async fn fetch_entities(
    source: &dyn RoadDataSource,
    stream: EntityStream,
    range: IdRange,
    after: Option<u64>,
    page_size: usize,
) -> Result<EntityPage<Entity>, SourceError> {
    match stream {
        EntityStream::LinkSequences => source
            .link_sequences(range, after, page_size)
            .await
            .map(widen_page),
        EntityStream::Objects(type_id) => source
            .road_objects(type_id, range, after, page_size)
            .await
            .map(widen_page),
    }
}

/// Fetch one page of `stream` events after `cursor`.
pub(crate) async fn fetch_events(
    source: &dyn RoadDataSource,
    stream: EntityStream,
    cursor: u64,
    page_size: usize,
) -> Result<EventPage<Entity>, SourceError> {
    match stream {
        EntityStream::LinkSequences => source
            .link_sequence_events(cursor, page_size)
            .await
            .map(widen_events),
        EntityStream::Objects(type_id) => source
            .road_object_events(type_id, cursor, page_size)
            .await
            .map(widen_events),
    }
}

/// Outcome of applying one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    /// The store will change.
    Written,
    /// The item matched or was older than the stored state.
    Unchanged,
}

struct Marks {
    objects: ObjectMarks,
    sequences: BTreeSet<u64>,
    at: DateTime<Utc>,
}

pub(crate) struct PageApplier<'a, S: ?Sized> {
    store: &'a S,
    batch: WriteBatch,
    objects: HashMap<ObjectKey, Option<RoadObject>>,
    sequences: HashMap<u64, Option<RoadLinkSequence>>,
    prune_before: NaiveDate,
    marks: Option<Marks>,
}

impl<'a, S: VersionedStore + ?Sized> PageApplier<'a, S> {
    /// Applier that writes entities only.
    pub(crate) fn for_backfill(store: &'a S, prune_before: NaiveDate) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
            objects: HashMap::new(),
            sequences: HashMap::new(),
            prune_before,
            marks: None,
        }
    }

    /// Applier that also records dirty marks observed at `at`.
    pub(crate) fn for_update(store: &'a S, prune_before: NaiveDate, at: DateTime<Utc>) -> Self {
        Self {
            marks: Some(Marks {
                objects: ObjectMarks::default(),
                sequences: BTreeSet::new(),
                at,
            }),
            ..Self::for_backfill(store, prune_before)
        }
    }

    pub(crate) fn batch_mut(&mut self) -> &mut WriteBatch {
        &mut self.batch
    }

    pub(crate) fn upsert(&mut self, entity: Entity) -> Result<Applied, StoreError> {
        match entity {
            Entity::Sequence(sequence) => self.upsert_sequence(sequence),
            Entity::Object(object) => self.upsert_object(object),
        }
    }

    pub(crate) fn apply_change(
        &mut self,
        stream: EntityStream,
        change: Change<Entity>,
    ) -> Result<Applied, StoreError> {
        match (change, stream) {
            (Change::Upsert(entity), _) => self.upsert(entity),
            (Change::Remove { id, .. }, EntityStream::LinkSequences) => self.remove_sequence(id),
            (Change::Remove { id, version }, EntityStream::Objects(type_id)) => {
                self.remove_object(ObjectKey::new(type_id, id), version)
            }
        }
    }

    pub(crate) fn upsert_sequence(
        &mut self,
        mut sequence: RoadLinkSequence,
    ) -> Result<Applied, StoreError> {
        sequence.prune_superseded(self.prune_before);
        let current = self.current_sequence(sequence.id)?;
        if current.as_ref() == Some(&sequence) {
            return Ok(Applied::Unchanged);
        }
        stage_put_sequence(&mut self.batch, &sequence)?;
        self.mark_sequence(sequence.id);
        self.sequences.insert(sequence.id, Some(sequence));
        Ok(Applied::Written)
    }

    pub(crate) fn remove_sequence(&mut self, id: u64) -> Result<Applied, StoreError> {
        if self.current_sequence(id)?.is_none() {
            return Ok(Applied::Unchanged);
        }
        stage_remove_sequence(&mut self.batch, id);
        self.mark_sequence(id);
        self.sequences.insert(id, None);
        Ok(Applied::Written)
    }

    pub(crate) fn upsert_object(&mut self, object: RoadObject) -> Result<Applied, StoreError> {
        let key = object.key();
        let current = self.current_object(key)?;
        if current
            .as_ref()
            .is_some_and(|stored| stored.version >= object.version)
        {
            return Ok(Applied::Unchanged);
        }
        stage_put_object(&mut self.batch, current.as_ref(), &object)?;
        if let Some(marks) = &mut self.marks {
            marks
                .objects
                .record(key, DirtyObjectChange::modified(object.version, marks.at));
        }
        self.objects.insert(key, Some(object));
        Ok(Applied::Written)
    }

    /// Remove an object. Any removal event deletes the stored object,
    /// whichever version it names.
    pub(crate) fn remove_object(
        &mut self,
        key: ObjectKey,
        version: Option<u32>,
    ) -> Result<Applied, StoreError> {
        let current = self.current_object(key)?;
        let removed_version = version
            .or_else(|| current.as_ref().map(|stored| stored.version))
            .unwrap_or_default();
        if let Some(marks) = &mut self.marks {
            marks
                .objects
                .record(key, DirtyObjectChange::deleted(removed_version, marks.at));
        }
        let Some(stored) = current else {
            return Ok(Applied::Unchanged);
        };
        stage_remove_object(&mut self.batch, &stored);
        self.objects.insert(key, None);
        Ok(Applied::Written)
    }

    /// Stage pending dirty marks and return the finished batch.
    pub(crate) fn finish(mut self) -> Result<WriteBatch, StoreError> {
        if let Some(marks) = self.marks.take() {
            let ledger = ChangeLedger::new(self.store);
            ledger.stage_link_sequences_dirty(&mut self.batch, marks.sequences, marks.at)?;
            ledger.stage_object_marks(&mut self.batch, marks.objects)?;
        }
        Ok(self.batch)
    }

    fn mark_sequence(&mut self, id: u64) {
        if let Some(marks) = &mut self.marks {
            marks.sequences.insert(id);
        }
    }

    fn current_sequence(&self, id: u64) -> Result<Option<RoadLinkSequence>, StoreError> {
        if let Some(pending) = self.sequences.get(&id) {
            return Ok(pending.clone());
        }
        tolerate_decode(
            self.store.get_json(Namespace::LinkSequences, &sequence_key(id)),
            || format!("link sequence {id}"),
        )
    }

    fn current_object(&self, key: ObjectKey) -> Result<Option<RoadObject>, StoreError> {
        if let Some(pending) = self.objects.get(&key) {
            return Ok(pending.clone());
        }
        tolerate_decode(
            self.store.get_json(Namespace::RoadObjects, &object_key(key)),
            || format!("road object {key}"),
        )
    }
}

/// Treat an undecodable stored record as absent so it gets overwritten.
fn tolerate_decode<T>(
    result: Result<Option<T>, StoreError>,
    describe: impl FnOnce() -> String,
) -> Result<Option<T>, StoreError> {
    match result {
        Err(err) if err.is_decode() => {
            warn!("overwriting undecodable {}: {err}", describe());
            Ok(None)
        }
        other => other,
    }
}
