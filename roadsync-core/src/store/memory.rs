//! In-memory [`VersionedStore`] used by tests and dry runs.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::keys::prefix_successor;
use super::{Namespace, StoreEntry, StoreError, VersionedStore, WriteBatch, WriteOp};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile store backed by one ordered map per namespace.
///
/// A single write lock is held for the whole of a commit, which makes each
/// batch atomic with respect to readers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<Namespace, Table>>,
    failing_commits: AtomicUsize,
    commits: AtomicUsize,
}

/// Error injected by [`MemoryStore::fail_next_commits`].
#[derive(Debug, thiserror::Error)]
#[error("injected commit failure")]
pub struct InjectedFailure;

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail without applying anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of batches committed successfully so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of entries held in `namespace`.
    #[must_use]
    pub fn len(&self, namespace: Namespace) -> usize {
        self.tables.read().get(&namespace).map_or(0, BTreeMap::len)
    }

    /// Whether `namespace` holds no entries.
    #[must_use]
    pub fn is_empty(&self, namespace: Namespace) -> bool {
        self.len(namespace) == 0
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl VersionedStore for MemoryStore {
    fn namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        Ok(Namespace::ALL.to_vec())
    }

    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .tables
            .read()
            .get(&namespace)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Commit {
                operations: batch.len(),
                source: Box::new(InjectedFailure),
            });
        }
        let mut tables = self.tables.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    tables.entry(namespace).or_default().insert(key, value);
                }
                WriteOp::Delete { namespace, key } => {
                    if let Some(table) = tables.get_mut(&namespace) {
                        table.remove(&key);
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn scan_prefix(
        &self,
        namespace: Namespace,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<StoreEntry>, StoreError> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&namespace) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let successor = prefix_successor(prefix);
        if let (Bound::Excluded(start), Some(end)) = (&lower, &successor) {
            if start >= end {
                return Ok(Vec::new());
            }
        }
        let upper = successor.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(table
            .range((lower, upper))
            .take(limit)
            .map(|(key, value)| StoreEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn clear_namespace(&self, namespace: Namespace) -> Result<(), StoreError> {
        self.tables.write().remove(&namespace);
        Ok(())
    }
}
