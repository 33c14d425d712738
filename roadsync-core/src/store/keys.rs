//! Big-endian composite key encodings.
//!
//! Every fixed-width component is written big-endian so that byte order
//! matches numeric order and prefix scans return entities sorted by id.

use crate::{EntityStream, ObjectKey, TypeId};

/// Key of a link sequence or a dirty link sequence entry.
#[must_use]
pub fn sequence_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Decode a key produced by [`sequence_key`].
#[must_use]
pub fn decode_sequence_key(bytes: &[u8]) -> Option<u64> {
    read_u64(bytes, 0).filter(|_| bytes.len() == 8)
}

/// Prefix shared by every object of `type_id`.
#[must_use]
pub fn type_prefix(type_id: TypeId) -> Vec<u8> {
    type_id.to_be_bytes().to_vec()
}

/// Key of a road object, a dirty object change or an exported feature.
#[must_use]
pub fn object_key(key: ObjectKey) -> Vec<u8> {
    let mut bytes = type_prefix(key.type_id);
    bytes.extend_from_slice(&key.id.to_be_bytes());
    bytes
}

/// Decode a key produced by [`object_key`].
#[must_use]
pub fn decode_object_key(bytes: &[u8]) -> Option<ObjectKey> {
    if bytes.len() != 12 {
        return None;
    }
    Some(ObjectKey::new(read_u32(bytes, 0)?, read_u64(bytes, 4)?))
}

/// Location index prefix for objects of `type_id` on `sequence_id`.
#[must_use]
pub fn location_prefix(sequence_id: u64, type_id: TypeId) -> Vec<u8> {
    let mut bytes = sequence_key(sequence_id);
    bytes.extend_from_slice(&type_id.to_be_bytes());
    bytes
}

/// Location index entry linking `sequence_id` to `object`.
#[must_use]
pub fn location_key(sequence_id: u64, object: ObjectKey) -> Vec<u8> {
    let mut bytes = location_prefix(sequence_id, object.type_id);
    bytes.extend_from_slice(&object.id.to_be_bytes());
    bytes
}

/// Decode the object referenced by a location index key.
#[must_use]
pub fn decode_location_key(bytes: &[u8]) -> Option<(u64, ObjectKey)> {
    if bytes.len() != 20 {
        return None;
    }
    let sequence_id = read_u64(bytes, 0)?;
    let key = ObjectKey::new(read_u32(bytes, 8)?, read_u64(bytes, 12)?);
    Some((sequence_id, key))
}

/// Settings key for a textual path such as `backfill/complete`.
#[must_use]
pub fn setting_key(path: &str) -> Vec<u8> {
    path.as_bytes().to_vec()
}

/// Settings key holding the event cursor of `stream`.
#[must_use]
pub fn cursor_key(stream: EntityStream) -> Vec<u8> {
    setting_key(&format!("cursor/{stream}"))
}

/// Marker distinguishing the two halves of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMarker {
    /// Last processed id.
    Cursor,
    /// Completion flag.
    Complete,
}

impl CheckpointMarker {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Cursor => "cursor",
            Self::Complete => "complete",
        }
    }
}

/// Settings key of a backfill checkpoint half for one stream partition.
#[must_use]
pub fn checkpoint_key(stream: EntityStream, partition: u32, marker: CheckpointMarker) -> Vec<u8> {
    setting_key(&format!(
        "backfill/{stream}/{partition:05}/{}",
        marker.suffix()
    ))
}

/// Prefix shared by every backfill checkpoint.
#[must_use]
pub fn checkpoint_prefix() -> Vec<u8> {
    setting_key("backfill/")
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (empty or all-`0xFF` prefixes).
#[must_use]
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bytes = prefix.to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return Some(bytes);
        }
    }
    None
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(slice.try_into().ok()?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice = bytes.get(offset..offset + 8)?;
    Some(u64::from_be_bytes(slice.try_into().ok()?))
}
