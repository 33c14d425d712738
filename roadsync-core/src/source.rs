//! Upstream road data source abstraction.
//!
//! The source offers two access patterns: keyset-paginated snapshots of an
//! entity stream restricted to an id range, used for backfill, and an ordered
//! event feed per stream, used for incremental updates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EntityStream, RoadLinkSequence, RoadObject, TypeId};

/// Half-open id range `[start, end)` used to partition backfill work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdRange {
    /// Inclusive lower bound.
    pub start: u64,
    /// Exclusive upper bound.
    pub end: u64,
}

impl IdRange {
    /// Construct a range.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Whether `id` falls inside the range.
    #[must_use]
    pub const fn contains(&self, id: u64) -> bool {
        self.start <= id && id < self.end
    }

    /// Split `[0, upper)` into `count` contiguous ranges.
    ///
    /// The final range absorbs the remainder so the union always covers the
    /// whole id space. A `count` of zero is treated as one.
    #[must_use]
    pub fn partition(upper: u64, count: u32) -> Vec<Self> {
        let count = u64::from(count.max(1));
        let width = (upper / count).max(1);
        let mut ranges = Vec::new();
        let mut start = 0;
        for index in 0..count {
            let end = if index + 1 == count {
                upper
            } else {
                (start + width).min(upper)
            };
            ranges.push(Self::new(start, end));
            start = end;
        }
        ranges
    }
}

/// One page of entities returned by a keyset-paginated fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPage<T> {
    /// Entities ordered by id.
    pub items: Vec<T>,
    /// Cursor to resume after, or `None` once the range is exhausted.
    #[serde(default)]
    pub next_cursor: Option<u64>,
}

/// A change carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change<T> {
    /// New or updated entity.
    Upsert(T),
    /// Entity removed upstream.
    Remove {
        /// Identifier of the removed entity.
        id: u64,
        /// Version that was removed, when the stream is versioned.
        #[serde(default)]
        version: Option<u32>,
    },
}

/// An event from the ordered change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    /// Monotonic event identifier within the stream.
    pub event_id: u64,
    /// The change itself.
    pub change: Change<T>,
}

/// One page of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage<T> {
    /// Events ordered by id.
    pub events: Vec<ChangeEvent<T>>,
    /// Cursor to request the following page with.
    pub next_cursor: u64,
}

/// Errors surfaced by a [`RoadDataSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// A failure worth retrying, such as a timeout or throttling response.
    #[error("transient failure fetching {url}: {reason}")]
    Transient {
        /// Request target.
        url: String,
        /// Human-readable description.
        reason: String,
        /// Suggested delay before retrying, if the server supplied one.
        retry_after: Option<Duration>,
    },
    /// The server returned a non-retryable status.
    #[error("request to {url} failed with status {status}")]
    Http {
        /// Request target.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The response body could not be decoded.
    #[error("failed to decode response from {url}: {message}")]
    Decode {
        /// Request target.
        url: String,
        /// Decoder message.
        message: String,
    },
    /// The request could not be constructed.
    #[error("invalid request for {operation}: {message}")]
    InvalidRequest {
        /// Operation being prepared.
        operation: &'static str,
        /// Explanation.
        message: String,
    },
    /// Retries ran out before the operation succeeded.
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Operation that kept failing.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// Final failure.
        #[source]
        last: Box<SourceError>,
    },
}

impl SourceError {
    /// Whether the error may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Access to the upstream road dataset.
///
/// Implementations must return entities and events in ascending id order.
#[async_trait]
pub trait RoadDataSource: Send + Sync {
    /// Fetch link sequences in `range` with ids greater than `after`.
    async fn link_sequences(
        &self,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadLinkSequence>, SourceError>;

    /// Fetch road objects of `type_id` in `range` with ids greater than `after`.
    async fn road_objects(
        &self,
        type_id: TypeId,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadObject>, SourceError>;

    /// Fetch link sequence events with ids greater than `cursor`.
    async fn link_sequence_events(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadLinkSequence>, SourceError>;

    /// Fetch road object events of `type_id` with ids greater than `cursor`.
    async fn road_object_events(
        &self,
        type_id: TypeId,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadObject>, SourceError>;

    /// Latest event id of `stream` published at or before `as_of`.
    async fn latest_event_id(
        &self,
        stream: EntityStream,
        as_of: DateTime<Utc>,
    ) -> Result<u64, SourceError>;
}
