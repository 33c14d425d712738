//! Response bodies that differ from the core page types.

use serde::Deserialize;

/// Body of the latest-event lookup.
#[derive(Debug, Deserialize)]
pub(super) struct LatestEventResponse {
    /// Latest event id, absent when the stream has no events yet.
    pub event_id: Option<u64>,
}
