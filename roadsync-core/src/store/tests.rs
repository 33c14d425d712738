//! Tests shared by every `VersionedStore` implementation.

use super::*;
use rstest::{fixture, rstest};

#[cfg(feature = "store-sqlite")]
use tempfile::TempDir;

fn memory() -> Box<dyn VersionedStore> {
    Box::new(MemoryStore::new())
}

#[cfg(feature = "store-sqlite")]
fn sqlite() -> Box<dyn VersionedStore> {
    Box::new(SqliteStore::open_in_memory().expect("open in-memory sqlite store"))
}

#[cfg(not(feature = "store-sqlite"))]
fn sqlite() -> Box<dyn VersionedStore> {
    memory()
}

#[fixture]
fn seeded() -> WriteBatch {
    let mut batch = WriteBatch::new();
    for id in [3_u8, 1, 2] {
        batch.put(Namespace::LinkSequences, vec![0, id], vec![id]);
    }
    batch.put(Namespace::LinkSequences, vec![1, 0], vec![9]);
    batch.put(Namespace::DirtyLinkSequences, vec![0, 1], b"{}".to_vec());
    batch
}

#[rstest]
fn commit_spans_namespaces(#[values(memory(), sqlite())] store: Box<dyn VersionedStore>, seeded: WriteBatch) {
    store.commit(seeded).expect("commit");
    assert_eq!(
        store.get(Namespace::LinkSequences, &[0, 1]).expect("get"),
        Some(vec![1])
    );
    assert_eq!(
        store.get(Namespace::DirtyLinkSequences, &[0, 1]).expect("get"),
        Some(b"{}".to_vec())
    );
    assert_eq!(store.get(Namespace::RoadObjects, &[0, 1]).expect("get"), None);
}

#[rstest]
fn later_operations_in_a_batch_win(#[values(memory(), sqlite())] store: Box<dyn VersionedStore>) {
    let mut batch = WriteBatch::new();
    batch.put(Namespace::Settings, b"k".to_vec(), b"1".to_vec());
    batch.delete(Namespace::Settings, b"k".to_vec());
    batch.put(Namespace::Settings, b"j".to_vec(), b"1".to_vec());
    batch.put(Namespace::Settings, b"j".to_vec(), b"2".to_vec());
    store.commit(batch).expect("commit");
    assert_eq!(store.get(Namespace::Settings, b"k").expect("get"), None);
    assert_eq!(
        store.get(Namespace::Settings, b"j").expect("get"),
        Some(b"2".to_vec())
    );
}

#[rstest]
fn scan_respects_prefix_cursor_and_limit(
    #[values(memory(), sqlite())] store: Box<dyn VersionedStore>,
    seeded: WriteBatch,
) {
    store.commit(seeded).expect("commit");
    let first = store
        .scan_prefix(Namespace::LinkSequences, &[0], None, 2)
        .expect("scan");
    let keys: Vec<_> = first.iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![vec![0, 1], vec![0, 2]]);

    let rest = store
        .scan_prefix(Namespace::LinkSequences, &[0], Some(&[0, 2]), 10)
        .expect("scan");
    let keys: Vec<_> = rest.iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![vec![0, 3]]);
}

#[rstest]
fn iteration_is_restartable(#[values(memory(), sqlite())] store: Box<dyn VersionedStore>, seeded: WriteBatch) {
    store.commit(seeded).expect("commit");
    let mut scan = store
        .iter_prefix(Namespace::LinkSequences, &[0])
        .page_size(1);
    let first = scan.next().expect("entry").expect("scan");
    assert_eq!(first.key, vec![0, 1]);
    let resume_from = scan.last_key().map(<[u8]>::to_vec).expect("last key");

    let resumed: Vec<_> = store
        .iter_prefix(Namespace::LinkSequences, &[0])
        .resume_after(resume_from)
        .map(|entry| entry.expect("scan").key)
        .collect();
    assert_eq!(resumed, vec![vec![0, 2], vec![0, 3]]);
}

#[rstest]
fn clearing_one_namespace_leaves_others(
    #[values(memory(), sqlite())] store: Box<dyn VersionedStore>,
    seeded: WriteBatch,
) {
    store.commit(seeded).expect("commit");
    store
        .clear_namespace(Namespace::DirtyLinkSequences)
        .expect("clear");
    assert!(
        store
            .scan_prefix(Namespace::DirtyLinkSequences, &[], None, 10)
            .expect("scan")
            .is_empty()
    );
    assert_eq!(
        store
            .scan_prefix(Namespace::LinkSequences, &[], None, 10)
            .expect("scan")
            .len(),
        4
    );
}

#[rstest]
fn undecodable_values_report_their_key(#[values(memory(), sqlite())] store: Box<dyn VersionedStore>) {
    store
        .put(Namespace::Settings, b"broken".to_vec(), b"{not json".to_vec())
        .expect("put");
    let err = store
        .get_json::<u64>(Namespace::Settings, b"broken")
        .expect_err("decode should fail");
    assert!(err.is_decode());
    assert!(matches!(err, StoreError::Decode { key, .. } if key == b"broken".to_vec()));
}

#[rstest]
fn open_namespace_checks_registry(#[values(memory(), sqlite())] store: Box<dyn VersionedStore>) {
    assert_eq!(
        store.open_namespace("dirty_objects").expect("registered"),
        Namespace::DirtyObjects
    );
    assert!(matches!(
        store.open_namespace("poi"),
        Err(StoreError::UnknownNamespace { .. })
    ));
}

#[rstest]
fn failed_memory_commit_applies_nothing(seeded: WriteBatch) {
    let store = MemoryStore::new();
    store.fail_next_commits(1);
    let err = store.commit(seeded.clone()).expect_err("injected failure");
    assert!(matches!(err, StoreError::Commit { operations: 5, .. }));
    assert!(store.is_empty(Namespace::LinkSequences));
    assert!(store.is_empty(Namespace::DirtyLinkSequences));

    store.commit(seeded).expect("second commit succeeds");
    assert_eq!(store.len(Namespace::LinkSequences), 4);
}

#[cfg(feature = "store-sqlite")]
#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

#[cfg(feature = "store-sqlite")]
#[rstest]
fn sqlite_store_persists_across_reopen(temp_dir: TempDir) {
    let path = temp_dir.path().join("roadsync.db");
    {
        let store = SqliteStore::open(&path).expect("open store");
        store
            .put(Namespace::Settings, b"backfill/complete".to_vec(), b"true".to_vec())
            .expect("put");
    }
    let reopened = SqliteStore::open(&path).expect("reopen store");
    assert_eq!(
        reopened
            .get(Namespace::Settings, b"backfill/complete")
            .expect("get"),
        Some(b"true".to_vec())
    );
    assert_eq!(reopened.namespaces().expect("list").len(), Namespace::ALL.len());
}

#[cfg(feature = "store-sqlite")]
#[rstest]
fn sqlite_store_rejects_foreign_namespace_tables(temp_dir: TempDir) {
    let path = temp_dir.path().join("roadsync.db");
    drop(SqliteStore::open(&path).expect("create store"));
    let connection = rusqlite::Connection::open(&path).expect("open raw connection");
    connection
        .execute(
            "CREATE TABLE ns_pois (key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID",
            [],
        )
        .expect("create foreign table");
    drop(connection);

    let err = SqliteStore::open(&path).expect_err("foreign table must be rejected");
    assert!(matches!(err, StoreError::UnknownNamespace { name } if name == "pois"));
}

#[cfg(feature = "store-sqlite")]
#[rstest]
fn sqlite_store_rejects_other_layout_versions(temp_dir: TempDir) {
    let path = temp_dir.path().join("roadsync.db");
    drop(SqliteStore::open(&path).expect("create store"));
    let connection = rusqlite::Connection::open(&path).expect("open raw connection");
    connection
        .execute("UPDATE roadsync_layout SET version = 7", [])
        .expect("bump version");
    drop(connection);

    let err = SqliteStore::open(&path).expect_err("version mismatch");
    assert!(matches!(
        err,
        StoreError::LayoutVersion {
            expected: LAYOUT_VERSION,
            found: 7
        }
    ));
}
