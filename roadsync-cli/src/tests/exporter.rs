//! JSON Lines exporter output.

use crate::exporter::JsonLinesExporter;
use camino::Utf8PathBuf;
use roadsync_core::test_support::{SPEED_LIMIT, fixture_time};
use roadsync_core::{
    ChangeBatch, Classification, ExportError, FeatureChange, FeatureExporter, ObjectKey,
};
use roadsync_data::test_support::block_on_for_tests;
use rstest::{fixture, rstest};
use std::fs;
use tempfile::TempDir;

fn removal(id: u64) -> FeatureChange {
    FeatureChange {
        key: ObjectKey::new(SPEED_LIMIT, id),
        version: Some(3),
        classification: Classification::Remove,
        content: None,
        content_hash: None,
    }
}

#[fixture]
fn batch() -> ChangeBatch {
    ChangeBatch {
        generated_at: fixture_time(),
        changes: vec![removal(1), removal(2)],
    }
}

struct Output {
    _dir: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn output() -> Output {
    let dir = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("exports")).expect("utf-8 path");
    Output { _dir: dir, path }
}

#[rstest]
fn batches_are_written_one_change_per_line(output: Output, batch: ChangeBatch) {
    let exporter = JsonLinesExporter::new(output.path.clone());
    block_on_for_tests(exporter.export(&batch)).expect("export succeeds");

    let file = output.path.join("changes-20240501T120000.000Z.jsonl");
    let contents = fs::read_to_string(&file).expect("read export");
    let lines: Vec<FeatureChange> = contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid change line"))
        .collect();
    assert_eq!(lines, batch.changes);
}

#[rstest]
fn existing_batch_files_are_not_overwritten(output: Output, batch: ChangeBatch) {
    let exporter = JsonLinesExporter::new(output.path.clone());
    block_on_for_tests(exporter.export(&batch)).expect("first export");

    let err = block_on_for_tests(exporter.export(&batch)).expect_err("second export");
    match err {
        ExportError::Io { source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists);
        }
        other => panic!("expected Io, found {other:?}"),
    }
}
