//! Exporter writing each change batch as a JSON Lines file.

use std::io;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use roadsync_core::{ChangeBatch, ExportError, FeatureExporter};
use roadsync_data::fs::{open_dir, write_new_synced};

/// Writes `changes-<timestamp>.jsonl` files, one change per line.
#[derive(Debug, Clone)]
pub(crate) struct JsonLinesExporter {
    dir: Utf8PathBuf,
}

impl JsonLinesExporter {
    pub(crate) fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn file_name(batch: &ChangeBatch) -> String {
        format!(
            "changes-{}.jsonl",
            batch.generated_at.format("%Y%m%dT%H%M%S%.3fZ")
        )
    }

    fn encode(batch: &ChangeBatch) -> Result<Vec<u8>, ExportError> {
        let mut contents = Vec::new();
        for change in &batch.changes {
            serde_json::to_writer(&mut contents, change).map_err(ExportError::Serialise)?;
            contents.push(b'\n');
        }
        Ok(contents)
    }

    fn write(dir: &Utf8Path, name: &str, contents: &[u8]) -> Result<(), ExportError> {
        let io_error = |source: io::Error| ExportError::Io {
            target: dir.join(name).to_string(),
            source,
        };
        let handle = open_dir(dir).map_err(io_error)?;
        write_new_synced(&handle, name, contents).map_err(io_error)
    }
}

#[async_trait]
impl FeatureExporter for JsonLinesExporter {
    async fn export(&self, batch: &ChangeBatch) -> Result<(), ExportError> {
        let contents = Self::encode(batch)?;
        let name = Self::file_name(batch);
        let dir = self.dir.clone();
        let target = dir.join(&name).to_string();
        tokio::task::spawn_blocking(move || Self::write(&dir, &name, &contents))
            .await
            .map_err(|err| ExportError::Io {
                target,
                source: io::Error::other(err),
            })?
    }
}
