//! Builders for road entities used by unit and behaviour tests.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use geo::{Coord, LineString};

use crate::entities::{stage_put_object, stage_put_sequence};
use crate::store::{StoreError, VersionedStore, WriteBatch};
use crate::{
    LinearLocation, PropertyValue, RoadLink, RoadLinkSequence, RoadObject, TypeId, Validity,
};

/// Type id used for speed-limit fixtures.
pub const SPEED_LIMIT: TypeId = 105;

/// Fixed timestamp used by fixtures.
#[must_use]
pub fn fixture_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A two-link sequence whose geometry is offset by `id`.
#[must_use]
pub fn sample_sequence(id: u64) -> RoadLinkSequence {
    #[expect(clippy::cast_precision_loss, reason = "fixture ids are small")]
    let offset = id as f64 * 0.01;
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();
    let link = |from: f64, to: f64, node: u64| RoadLink {
        start_position: from,
        end_position: to,
        geometry: LineString::from(vec![
            Coord {
                x: 10.0 + offset + from,
                y: 59.0,
            },
            Coord {
                x: 10.0 + offset + to,
                y: 59.0,
            },
        ]),
        validity: Validity::open(start),
        start_node: node,
        end_node: node + 1,
    };
    RoadLinkSequence {
        id,
        links: vec![link(0.0, 0.5, id * 10), link(0.5, 1.0, id * 10 + 1)],
    }
}

/// A speed-limit object located on `sequence_id`.
#[must_use]
pub fn sample_object(id: u64, version: u32, sequence_id: u64, speed: i64) -> RoadObject {
    RoadObject {
        type_id: SPEED_LIMIT,
        id,
        version,
        last_modified: fixture_time(),
        properties: BTreeMap::from([("speed".to_owned(), PropertyValue::Integer(speed))]),
        locations: vec![LinearLocation {
            sequence_id,
            start: 0.0,
            end: 0.4,
            direction: None,
            lanes: Vec::new(),
        }],
    }
}

/// Write sequences and objects straight into `store`, with index entries.
///
/// # Errors
///
/// Propagates encoding and commit failures.
pub fn seed_entities<S: VersionedStore + ?Sized>(
    store: &S,
    sequences: &[RoadLinkSequence],
    objects: &[RoadObject],
) -> Result<(), StoreError> {
    let mut batch = WriteBatch::new();
    for sequence in sequences {
        stage_put_sequence(&mut batch, sequence)?;
    }
    for object in objects {
        stage_put_object(&mut batch, None, object)?;
    }
    store.commit(batch)
}
