//! Ordered key-value storage partitioned into namespaces.
//!
//! The [`VersionedStore`] trait is the only mutation point of the engine.
//! Writes are grouped into a [`WriteBatch`] and applied atomically, so an
//! entity write and the dirty entry that records it always become visible
//! together. Keys are raw bytes ordered lexicographically; the [`keys`]
//! module provides the composite encodings used by the rest of the crate.
//!
//! # Examples
//!
//! ```rust
//! use roadsync_core::store::{MemoryStore, Namespace, VersionedStore, WriteBatch};
//!
//! # fn main() -> Result<(), roadsync_core::store::StoreError> {
//! let store = MemoryStore::default();
//! let mut batch = WriteBatch::new();
//! batch.put(Namespace::Settings, b"a/1".to_vec(), b"x".to_vec());
//! batch.put(Namespace::Settings, b"a/2".to_vec(), b"y".to_vec());
//! batch.put(Namespace::Settings, b"b/1".to_vec(), b"z".to_vec());
//! store.commit(batch)?;
//!
//! let keys: Vec<_> = store
//!     .scan_prefix(Namespace::Settings, b"a/", None, 10)?
//!     .into_iter()
//!     .map(|entry| entry.key)
//!     .collect();
//! assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use serde::de::DeserializeOwned;

mod batch;
mod error;
pub mod keys;
mod memory;
mod namespace;
#[cfg(feature = "store-sqlite")]
mod sqlite;

pub use batch::{WriteBatch, WriteOp};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use namespace::Namespace;
#[cfg(feature = "store-sqlite")]
pub use sqlite::{LAYOUT_VERSION, SqliteStore};

/// Default number of entries fetched per page by [`PrefixScan`].
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// A key and value read from a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Raw key.
    pub key: Vec<u8>,
    /// Raw value.
    pub value: Vec<u8>,
}

/// An embedded ordered key-value store with atomic multi-namespace batches.
///
/// Implementations must guarantee that [`commit`](Self::commit) applies
/// either every operation of the batch or none of them.
pub trait VersionedStore: Send + Sync {
    /// Namespaces present in the backing store.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot list its namespaces.
    fn namespaces(&self) -> Result<Vec<Namespace>, StoreError>;

    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the read fails.
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every operation of `batch` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Commit`] when the batch could not be applied. In
    /// that case none of its operations are visible.
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Return up to `limit` entries whose key starts with `prefix`, in key
    /// order, skipping keys less than or equal to `after`.
    ///
    /// # Errors
    ///
    /// Returns an error when the scan fails.
    fn scan_prefix(
        &self,
        namespace: Namespace,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<StoreEntry>, StoreError>;

    /// Remove every entry of `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error when the namespace could not be cleared.
    fn clear_namespace(&self, namespace: Namespace) -> Result<(), StoreError>;

    /// Resolve `name` against the registry and confirm the store provides it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownNamespace`] for names outside the registry
    /// and [`StoreError::MissingNamespace`] when the store lacks the namespace.
    fn open_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        let namespace: Namespace = name.parse()?;
        if self.namespaces()?.contains(&namespace) {
            Ok(namespace)
        } else {
            Err(StoreError::MissingNamespace { namespace })
        }
    }

    /// Write a single entry.
    ///
    /// # Errors
    ///
    /// Propagates commit failures.
    fn put(&self, namespace: Namespace, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(namespace, key, value);
        self.commit(batch)
    }

    /// Delete a single entry.
    ///
    /// # Errors
    ///
    /// Propagates commit failures.
    fn delete(&self, namespace: Namespace, key: Vec<u8>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(namespace, key);
        self.commit(batch)
    }
}

/// Typed helpers available on every [`VersionedStore`].
pub trait StoreExt: VersionedStore {
    /// Read and decode a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] when the stored bytes are not a valid
    /// encoding of `T`.
    fn get_json<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        self.get(namespace, key)?
            .map(|bytes| decode_json(namespace, key, &bytes))
            .transpose()
    }

    /// Iterate every entry under `prefix` in key order.
    fn iter_prefix(&self, namespace: Namespace, prefix: &[u8]) -> PrefixScan<'_, Self> {
        PrefixScan::new(self, namespace, prefix.to_vec())
    }
}

impl<S: VersionedStore + ?Sized> StoreExt for S {}

/// Decode a JSON value read from `namespace` at `key`.
///
/// # Errors
///
/// Returns [`StoreError::Decode`] carrying the offending key.
pub fn decode_json<T: DeserializeOwned>(
    namespace: Namespace,
    key: &[u8],
    bytes: &[u8],
) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
        namespace,
        key: key.to_vec(),
        source,
    })
}

/// A restartable, paged iteration over the entries under a prefix.
///
/// The scan remembers the last key it yielded; [`PrefixScan::resume_after`]
/// continues a previous scan from such a key.
pub struct PrefixScan<'a, S: ?Sized> {
    store: &'a S,
    namespace: Namespace,
    prefix: Vec<u8>,
    last_key: Option<Vec<u8>>,
    buffer: VecDeque<StoreEntry>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, S: VersionedStore + ?Sized> PrefixScan<'a, S> {
    fn new(store: &'a S, namespace: Namespace, prefix: Vec<u8>) -> Self {
        Self {
            store,
            namespace,
            prefix,
            last_key: None,
            buffer: VecDeque::new(),
            page_size: DEFAULT_SCAN_PAGE,
            exhausted: false,
        }
    }

    /// Continue after `key` instead of the start of the prefix.
    #[must_use]
    pub fn resume_after(mut self, key: Vec<u8>) -> Self {
        self.last_key = Some(key);
        self
    }

    /// Fetch `page_size` entries per underlying scan.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Key of the entry yielded last.
    #[must_use]
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    fn refill(&mut self) -> Result<(), StoreError> {
        let page = self.store.scan_prefix(
            self.namespace,
            &self.prefix,
            self.last_key.as_deref(),
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: VersionedStore + ?Sized> Iterator for PrefixScan<'_, S> {
    type Item = Result<StoreEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.refill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let entry = self.buffer.pop_front()?;
        self.last_key = Some(entry.key.clone());
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests;
