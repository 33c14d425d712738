//! Write operations applied atomically by [`VersionedStore::commit`].
//!
//! [`VersionedStore::commit`]: super::VersionedStore::commit

use serde::Serialize;

use super::{Namespace, StoreError};

/// A single write within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite `key` with `value`.
    Put {
        /// Target namespace.
        namespace: Namespace,
        /// Entry key.
        key: Vec<u8>,
        /// Entry value.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// Target namespace.
        namespace: Namespace,
        /// Entry key.
        key: Vec<u8>,
    },
}

impl WriteOp {
    /// Namespace touched by the operation.
    #[must_use]
    pub const fn namespace(&self) -> Namespace {
        match self {
            Self::Put { namespace, .. } | Self::Delete { namespace, .. } => *namespace,
        }
    }
}

/// An ordered list of writes that commit together or not at all.
///
/// Later operations on the same key take effect over earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Stage a raw put.
    pub fn put(&mut self, namespace: Namespace, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            namespace,
            key,
            value,
        });
    }

    /// Stage a put of a JSON-encoded value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] when `value` cannot be serialised.
    pub fn put_json<T: Serialize + ?Sized>(
        &mut self,
        namespace: Namespace,
        key: Vec<u8>,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|source| StoreError::Encode { namespace, source })?;
        self.put(namespace, key, bytes);
        Ok(())
    }

    /// Stage a delete.
    pub fn delete(&mut self, namespace: Namespace, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { namespace, key });
    }

    /// Append every operation of `other`.
    pub fn extend(&mut self, other: Self) {
        self.ops.extend(other.ops);
    }

    /// Number of staged operations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing has been staged.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged operations in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume the batch, yielding its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
