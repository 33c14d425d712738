use thiserror::Error;

use super::Namespace;

/// Errors raised by [`VersionedStore`](super::VersionedStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database could not be opened.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to open store at {path}")]
    Open {
        /// Location of the database.
        path: std::path::PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A schema step failed while preparing the store.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to execute schema step '{step}'")]
    Schema {
        /// Step being executed.
        step: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// The store layout version differs from the one this build expects.
    #[error("expected store layout version {expected} but found {found}")]
    LayoutVersion {
        /// Version this build writes.
        expected: i64,
        /// Version recorded in the store.
        found: i64,
    },
    /// A namespace name is not part of the registry.
    #[error("unknown namespace '{name}'")]
    UnknownNamespace {
        /// Offending name.
        name: String,
    },
    /// A registered namespace is absent from the store.
    #[error("namespace '{namespace}' is missing from the store")]
    MissingNamespace {
        /// Absent namespace.
        namespace: Namespace,
    },
    /// A read or scan failed.
    #[cfg(feature = "store-sqlite")]
    #[error("store operation '{operation}' failed on namespace '{namespace}'")]
    Sqlite {
        /// Operation being attempted.
        operation: &'static str,
        /// Namespace being accessed.
        namespace: Namespace,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A value could not be serialised before writing.
    #[error("failed to encode value for namespace '{namespace}'")]
    Encode {
        /// Target namespace.
        namespace: Namespace,
        /// Serialiser failure.
        #[source]
        source: serde_json::Error,
    },
    /// A stored value could not be decoded.
    ///
    /// Callers may skip the key and continue.
    #[error("undecodable value in namespace '{namespace}' at key {key:02x?}")]
    Decode {
        /// Namespace holding the value.
        namespace: Namespace,
        /// Raw key of the value.
        key: Vec<u8>,
        /// Deserialiser failure.
        #[source]
        source: serde_json::Error,
    },
    /// A batch could not be committed. No operation in the batch was applied.
    #[error("failed to commit batch of {operations} operations")]
    Commit {
        /// Number of operations in the rejected batch.
        operations: usize,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    /// Whether the error concerns a single undecodable value.
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
