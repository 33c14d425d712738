//! Scripted collaborators for coordinator tests.
//!
//! [`StubSource`] serves entity pages from in-memory maps and releases
//! change events in waves: a wave becomes visible only once every event of
//! the earlier waves has been delivered, which mimics events still being
//! paginated upstream while a pass is running.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use roadsync_core::test_support::fixture_time;
use roadsync_core::{
    Change, ChangeBatch, ChangeEvent, EntityPage, EntityStream, EventPage, ExportError,
    FeatureExporter, IdRange, RoadDataSource, RoadLinkSequence, RoadObject, SourceError, TypeId,
};

/// One scripted change event.
#[derive(Debug, Clone)]
pub enum StubEvent {
    /// A link sequence was created or replaced.
    UpsertSequence(RoadLinkSequence),
    /// A link sequence was removed.
    RemoveSequence(u64),
    /// A road object version was published.
    UpsertObject(RoadObject),
    /// A road object version was removed.
    RemoveObject {
        /// Object type.
        type_id: TypeId,
        /// Object id.
        id: u64,
        /// Removed version.
        version: Option<u32>,
    },
}

impl StubEvent {
    fn stream(&self) -> EntityStream {
        match self {
            Self::UpsertSequence(_) | Self::RemoveSequence(_) => EntityStream::LinkSequences,
            Self::UpsertObject(object) => EntityStream::Objects(object.type_id),
            Self::RemoveObject { type_id, .. } => EntityStream::Objects(*type_id),
        }
    }
}

/// An entity page request seen by the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRecord {
    /// Stream fetched.
    pub stream: EntityStream,
    /// Range requested.
    pub range: IdRange,
    /// Cursor requested.
    pub after: Option<u64>,
}

#[derive(Debug, Clone)]
struct Scripted {
    event_id: u64,
    wave: usize,
    published_at: DateTime<Utc>,
    event: StubEvent,
}

#[derive(Debug, Default)]
struct StubState {
    sequences: BTreeMap<u64, RoadLinkSequence>,
    objects: BTreeMap<TypeId, BTreeMap<u64, RoadObject>>,
    events: Vec<Scripted>,
    waves: usize,
    visible_waves: usize,
    delivered: BTreeMap<EntityStream, u64>,
    failing_calls: usize,
    failing_ranges: Vec<(EntityStream, u64)>,
    fetches: Vec<FetchRecord>,
    event_fetches: usize,
}

impl StubState {
    fn take_failure(&mut self, operation: &str) -> Result<(), SourceError> {
        if self.failing_calls == 0 {
            return Ok(());
        }
        self.failing_calls -= 1;
        Err(SourceError::Transient {
            url: format!("stub://{operation}"),
            reason: "scripted failure".to_owned(),
            retry_after: None,
        })
    }

    fn visible(&self, stream: EntityStream) -> impl Iterator<Item = &Scripted> {
        let visible_waves = self.visible_waves;
        self.events
            .iter()
            .filter(move |e| e.wave < visible_waves && e.event.stream() == stream)
    }

    fn all_visible_delivered(&self) -> bool {
        self.events
            .iter()
            .filter(|e| e.wave < self.visible_waves)
            .all(|e| {
                self.delivered
                    .get(&e.event.stream())
                    .is_some_and(|&delivered| delivered >= e.event_id)
            })
    }

    fn entity_page<T: Clone>(
        &mut self,
        stream: EntityStream,
        entities: impl Iterator<Item = (u64, T)>,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<T>, SourceError> {
        self.take_failure("entities")?;
        self.fetches.push(FetchRecord {
            stream,
            range,
            after,
        });
        if self.failing_ranges.contains(&(stream, range.start)) {
            return Err(SourceError::Http {
                url: format!("stub://{stream}/{}", range.start),
                status: 400,
            });
        }
        let mut matching: Vec<(u64, T)> = entities
            .filter(|(id, _)| range.contains(*id) && after.is_none_or(|after| *id > after))
            .collect();
        let has_more = matching.len() > page_size;
        matching.truncate(page_size);
        let next_cursor = if has_more {
            matching.last().map(|(id, _)| *id)
        } else {
            None
        };
        Ok(EntityPage {
            items: matching.into_iter().map(|(_, entity)| entity).collect(),
            next_cursor,
        })
    }

    fn event_page(
        &mut self,
        stream: EntityStream,
        cursor: u64,
        page_size: usize,
    ) -> Result<Vec<(u64, StubEvent)>, SourceError> {
        self.take_failure("events")?;
        self.event_fetches += 1;
        let events: Vec<(u64, StubEvent)> = self
            .visible(stream)
            .filter(|e| e.event_id > cursor)
            .take(page_size)
            .map(|e| (e.event_id, e.event.clone()))
            .collect();
        if let Some(&(last, _)) = events.last() {
            let delivered = self.delivered.entry(stream).or_default();
            *delivered = (*delivered).max(last);
        }
        Ok(events)
    }
}

fn next_cursor(cursor: u64, events: &[(u64, StubEvent)]) -> u64 {
    events.last().map_or(cursor, |(id, _)| *id)
}

/// In-memory [`RoadDataSource`] driven by a script.
#[derive(Debug, Default)]
pub struct StubSource {
    state: Mutex<StubState>,
}

impl StubSource {
    /// Serve `sequences` from entity pages.
    pub fn insert_sequences(&self, sequences: impl IntoIterator<Item = RoadLinkSequence>) {
        let mut state = self.state.lock();
        for sequence in sequences {
            state.sequences.insert(sequence.id, sequence);
        }
    }

    /// Serve `objects` from entity pages.
    pub fn insert_objects(&self, objects: impl IntoIterator<Item = RoadObject>) {
        let mut state = self.state.lock();
        for object in objects {
            state
                .objects
                .entry(object.type_id)
                .or_default()
                .insert(object.id, object);
        }
    }

    /// Schedule a wave of events, published at the fixture time.
    ///
    /// The first wave is visible immediately.
    pub fn push_wave(&self, events: impl IntoIterator<Item = StubEvent>) {
        let mut state = self.state.lock();
        let wave = state.waves;
        state.waves += 1;
        if wave == 0 {
            state.visible_waves = 1;
        }
        for event in events {
            let event_id = state.events.last().map_or(1, |e| e.event_id + 1);
            state.events.push(Scripted {
                event_id,
                wave,
                published_at: fixture_time(),
                event,
            });
        }
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next_calls(&self, count: usize) {
        self.state.lock().failing_calls = count;
    }

    /// Permanently fail entity fetches of `stream` for the range starting at `start`.
    pub fn fail_range(&self, stream: EntityStream, start: u64) {
        self.state.lock().failing_ranges.push((stream, start));
    }

    /// Drop every scripted failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_calls = 0;
        state.failing_ranges.clear();
    }

    /// Entity page requests seen so far.
    #[must_use]
    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.state.lock().fetches.clone()
    }

    /// Number of event page requests seen so far.
    #[must_use]
    pub fn event_fetches(&self) -> usize {
        self.state.lock().event_fetches
    }
}

fn sequence_changes(events: Vec<(u64, StubEvent)>) -> Vec<ChangeEvent<RoadLinkSequence>> {
    events
        .into_iter()
        .filter_map(|(event_id, event)| {
            let change = match event {
                StubEvent::UpsertSequence(sequence) => Change::Upsert(sequence),
                StubEvent::RemoveSequence(id) => Change::Remove { id, version: None },
                StubEvent::UpsertObject(_) | StubEvent::RemoveObject { .. } => return None,
            };
            Some(ChangeEvent { event_id, change })
        })
        .collect()
}

fn object_changes(events: Vec<(u64, StubEvent)>) -> Vec<ChangeEvent<RoadObject>> {
    events
        .into_iter()
        .filter_map(|(event_id, event)| {
            let change = match event {
                StubEvent::UpsertObject(object) => Change::Upsert(object),
                StubEvent::RemoveObject { id, version, .. } => Change::Remove { id, version },
                StubEvent::UpsertSequence(_) | StubEvent::RemoveSequence(_) => return None,
            };
            Some(ChangeEvent { event_id, change })
        })
        .collect()
}

#[async_trait]
impl RoadDataSource for StubSource {
    async fn link_sequences(
        &self,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadLinkSequence>, SourceError> {
        let mut state = self.state.lock();
        let entities: Vec<_> = state
            .sequences
            .iter()
            .map(|(id, sequence)| (*id, sequence.clone()))
            .collect();
        state.entity_page(
            EntityStream::LinkSequences,
            entities.into_iter(),
            range,
            after,
            page_size,
        )
    }

    async fn road_objects(
        &self,
        type_id: TypeId,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadObject>, SourceError> {
        let mut state = self.state.lock();
        let entities: Vec<_> = state
            .objects
            .get(&type_id)
            .into_iter()
            .flatten()
            .map(|(id, object)| (*id, object.clone()))
            .collect();
        state.entity_page(
            EntityStream::Objects(type_id),
            entities.into_iter(),
            range,
            after,
            page_size,
        )
    }

    async fn link_sequence_events(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadLinkSequence>, SourceError> {
        let events = self
            .state
            .lock()
            .event_page(EntityStream::LinkSequences, cursor, page_size)?;
        let next_cursor = next_cursor(cursor, &events);
        Ok(EventPage {
            events: sequence_changes(events),
            next_cursor,
        })
    }

    async fn road_object_events(
        &self,
        type_id: TypeId,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadObject>, SourceError> {
        let events = self
            .state
            .lock()
            .event_page(EntityStream::Objects(type_id), cursor, page_size)?;
        let next_cursor = next_cursor(cursor, &events);
        Ok(EventPage {
            events: object_changes(events),
            next_cursor,
        })
    }

    async fn latest_event_id(
        &self,
        stream: EntityStream,
        as_of: DateTime<Utc>,
    ) -> Result<u64, SourceError> {
        let mut state = self.state.lock();
        state.take_failure("latest")?;
        if state.visible_waves < state.waves && state.all_visible_delivered() {
            state.visible_waves += 1;
        }
        Ok(state
            .visible(stream)
            .filter(|e| e.published_at <= as_of)
            .map(|e| e.event_id)
            .max()
            .unwrap_or_default())
    }
}

/// Exporter that keeps every batch it receives.
#[derive(Debug, Default)]
pub struct RecordingExporter {
    batches: Mutex<Vec<ChangeBatch>>,
    reject_next: Mutex<bool>,
}

impl RecordingExporter {
    /// Batches received so far.
    #[must_use]
    pub fn batches(&self) -> Vec<ChangeBatch> {
        self.batches.lock().clone()
    }

    /// Reject the next batch.
    pub fn reject_next(&self) {
        *self.reject_next.lock() = true;
    }
}

#[async_trait]
impl FeatureExporter for RecordingExporter {
    async fn export(&self, batch: &ChangeBatch) -> Result<(), ExportError> {
        if std::mem::take(&mut *self.reject_next.lock()) {
            return Err(ExportError::Rejected {
                message: "scripted rejection".to_owned(),
            });
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Drive `future` to completion on a fresh current-thread runtime.
///
/// # Panics
///
/// Panics if the runtime cannot be created.
pub fn block_on_for_tests<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("build test runtime")
        .block_on(future)
}
