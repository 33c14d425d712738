//! SQLite-backed [`VersionedStore`].
//!
//! Each namespace maps to a `WITHOUT ROWID` table named `ns_<namespace>`
//! holding `(key BLOB PRIMARY KEY, value BLOB)`. Batches run inside a single
//! SQLite transaction, so a failed commit leaves every table untouched.

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};

use super::keys::prefix_successor;
use super::{Namespace, StoreEntry, StoreError, VersionedStore, WriteBatch, WriteOp};

/// Version of the table layout written by this build.
pub const LAYOUT_VERSION: i64 = 1;

const TABLE_PREFIX: &str = "ns_";

/// Durable store persisted in a single SQLite database file.
pub struct SqliteStore {
    connection: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when the database cannot be opened,
    /// [`StoreError::Schema`] when the layout cannot be created, and
    /// [`StoreError::UnknownNamespace`] or [`StoreError::LayoutVersion`] when
    /// the existing layout differs from the registry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut connection = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        connection
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(|source| StoreError::Schema {
                step: "enable write-ahead log",
                source,
            })?;
        connection
            .pragma_update(None, "synchronous", "FULL")
            .map_err(|source| StoreError::Schema {
                step: "set synchronous mode",
                source,
            })?;
        initialise_layout(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error when the layout cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut connection =
            Connection::open_in_memory().map_err(|source| StoreError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;
        initialise_layout(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
            path: None,
        })
    }

    /// Location of the database file, if the store is on disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn table(namespace: Namespace) -> String {
    format!("{TABLE_PREFIX}{}", namespace.name())
}

fn initialise_layout(connection: &mut Connection) -> Result<(), StoreError> {
    let transaction = connection
        .transaction()
        .map_err(|source| StoreError::Schema {
            step: "begin layout transaction",
            source,
        })?;

    for namespace in Namespace::ALL {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID",
            table(namespace)
        );
        run_layout_step(&transaction, "create namespace table", &sql)?;
    }
    ensure_layout_version(&transaction)?;
    validate_namespaces(&transaction)?;

    transaction.commit().map_err(|source| StoreError::Schema {
        step: "commit layout transaction",
        source,
    })
}

fn run_layout_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), StoreError> {
    transaction
        .execute(sql, [])
        .map(|_| ())
        .map_err(|source| StoreError::Schema { step, source })
}

fn ensure_layout_version(transaction: &Transaction<'_>) -> Result<(), StoreError> {
    run_layout_step(
        transaction,
        "create layout version table",
        "CREATE TABLE IF NOT EXISTS roadsync_layout (
            version INTEGER PRIMARY KEY CHECK (version > 0),
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ) WITHOUT ROWID",
    )?;

    let existing: Option<i64> = transaction
        .query_row("SELECT version FROM roadsync_layout LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|source| StoreError::Schema {
            step: "read layout version",
            source,
        })?;

    match existing {
        Some(version) if version == LAYOUT_VERSION => Ok(()),
        Some(found) => Err(StoreError::LayoutVersion {
            expected: LAYOUT_VERSION,
            found,
        }),
        None => transaction
            .execute(
                "INSERT INTO roadsync_layout (version) VALUES (?1)",
                [LAYOUT_VERSION],
            )
            .map(|_| ())
            .map_err(|source| StoreError::Schema {
                step: "record layout version",
                source,
            }),
    }
}

fn namespace_tables(connection: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut statement = connection.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ns\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn validate_namespaces(connection: &Connection) -> Result<(), StoreError> {
    let tables = namespace_tables(connection).map_err(|source| StoreError::Schema {
        step: "list namespace tables",
        source,
    })?;
    let mut found = Vec::with_capacity(tables.len());
    for name in &tables {
        let bare = name.strip_prefix(TABLE_PREFIX).unwrap_or(name);
        found.push(bare.parse::<Namespace>()?);
    }
    match Namespace::ALL.into_iter().find(|ns| !found.contains(ns)) {
        Some(namespace) => Err(StoreError::MissingNamespace { namespace }),
        None => Ok(()),
    }
}

fn apply_batch(connection: &mut Connection, batch: WriteBatch) -> Result<(), rusqlite::Error> {
    let transaction = connection.transaction()?;
    for op in batch.into_ops() {
        match op {
            WriteOp::Put {
                namespace,
                key,
                value,
            } => {
                let sql = format!(
                    "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                    table(namespace)
                );
                transaction
                    .prepare_cached(&sql)?
                    .execute(params![key, value])?;
            }
            WriteOp::Delete { namespace, key } => {
                let sql = format!("DELETE FROM {} WHERE key = ?1", table(namespace));
                transaction.prepare_cached(&sql)?.execute(params![key])?;
            }
        }
    }
    transaction.commit()
}

impl VersionedStore for SqliteStore {
    fn namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let connection = self.connection.lock();
        let tables = namespace_tables(&connection).map_err(|source| StoreError::Schema {
            step: "list namespace tables",
            source,
        })?;
        Ok(tables
            .iter()
            .filter_map(|name| name.strip_prefix(TABLE_PREFIX))
            .filter_map(Namespace::from_name)
            .collect())
    }

    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let connection = self.connection.lock();
        let sql = format!("SELECT value FROM {} WHERE key = ?1", table(namespace));
        connection
            .prepare_cached(&sql)
            .and_then(|mut statement| {
                statement
                    .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
                    .optional()
            })
            .map_err(|source| StoreError::Sqlite {
                operation: "get",
                namespace,
                source,
            })
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let operations = batch.len();
        let mut connection = self.connection.lock();
        apply_batch(&mut connection, batch).map_err(|source| StoreError::Commit {
            operations,
            source: Box::new(source),
        })
    }

    fn scan_prefix(
        &self,
        namespace: Namespace,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<StoreEntry>, StoreError> {
        let mut conditions = vec!["key >= ?1".to_owned()];
        let mut values = vec![Value::Blob(prefix.to_vec())];
        if let Some(upper) = prefix_successor(prefix) {
            values.push(Value::Blob(upper));
            conditions.push(format!("key < ?{}", values.len()));
        }
        if let Some(after) = after {
            values.push(Value::Blob(after.to_vec()));
            conditions.push(format!("key > ?{}", values.len()));
        }
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        let sql = format!(
            "SELECT key, value FROM {} WHERE {} ORDER BY key LIMIT ?{}",
            table(namespace),
            conditions.join(" AND "),
            values.len()
        );

        let connection = self.connection.lock();
        let scan = || -> Result<Vec<StoreEntry>, rusqlite::Error> {
            let mut statement = connection.prepare_cached(&sql)?;
            let rows = statement.query_map(params_from_iter(values.iter()), |row| {
                Ok(StoreEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })?;
            rows.collect()
        };
        scan().map_err(|source| StoreError::Sqlite {
            operation: "scan prefix",
            namespace,
            source,
        })
    }

    fn clear_namespace(&self, namespace: Namespace) -> Result<(), StoreError> {
        let connection = self.connection.lock();
        connection
            .execute(&format!("DELETE FROM {}", table(namespace)), [])
            .map(|_| ())
            .map_err(|source| StoreError::Sqlite {
                operation: "clear namespace",
                namespace,
                source,
            })
    }
}
