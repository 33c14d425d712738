//! Wiring of store, source and exporter into the sync phases.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use chrono::Utc;
use log::{info, warn};
use roadsync_core::store::{SqliteStore, VersionedStore, WriteBatch};
use roadsync_core::{FeatureExporter, LinkGeometryEncoder};
use roadsync_data::fs::ensure_parent_dir;
use roadsync_data::settings::stage_backfill_reset;
use roadsync_data::{
    BackfillCoordinator, ExportCycle, ExportReport, HttpRoadSource, RetryingSource, SyncContext,
    UpdateCoordinator,
};
use tokio_util::sync::CancellationToken;

use crate::CliError;
use crate::config::{ResetArgs, SyncArgs, SyncMode, SyncRunConfig};
use crate::exporter::JsonLinesExporter;

/// How often and how long a sync keeps cycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SyncPlan {
    pub(crate) mode: SyncMode,
    pub(crate) poll_interval: Duration,
    pub(crate) once: bool,
}

impl From<&SyncRunConfig> for SyncPlan {
    fn from(config: &SyncRunConfig) -> Self {
        Self {
            mode: config.mode,
            poll_interval: config.poll_interval,
            once: config.once,
        }
    }
}

/// Totals printed when a sync finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SyncSummary {
    pub(crate) backfilled: u64,
    pub(crate) backfill_complete: bool,
    pub(crate) cycles: u32,
    pub(crate) changes: u64,
    pub(crate) exported: usize,
    pub(crate) interrupted: bool,
}

impl SyncSummary {
    fn absorb_export(&mut self, report: &ExportReport) {
        self.exported += report.emitted();
    }
}

pub(crate) fn run_sync(args: SyncArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    let summary = runtime.block_on(sync(config))?;
    write_summary(writer, &summary)
}

pub(crate) fn run_reset(args: ResetArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let path = args.into_store_path()?;
    let store = open_store(&path)?;
    reset_backfill(&store, &path)?;
    writeln!(writer, "backfill progress cleared in {path}").map_err(CliError::WriteSummary)
}

pub(crate) fn reset_backfill<S: VersionedStore + ?Sized>(
    store: &S,
    path: &Utf8Path,
) -> Result<(), CliError> {
    let store_error = |source| CliError::ResetBackfill {
        path: path.to_path_buf(),
        source,
    };
    let mut batch = WriteBatch::new();
    stage_backfill_reset(store, &mut batch).map_err(store_error)?;
    store.commit(batch).map_err(store_error)
}

async fn sync(config: SyncRunConfig) -> Result<SyncSummary, CliError> {
    let store = open_store(&config.store)?;
    let source = RetryingSource::new(
        HttpRoadSource::new(config.source_url.clone())?,
        config.engine.retry.clone(),
    );
    let shutdown = CancellationToken::new();
    let watcher = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing in-flight pages");
            watcher.cancel();
        }
    });
    let context = SyncContext::new(Arc::new(store), Arc::new(source), config.engine.clone())
        .with_shutdown(shutdown);
    let exporter = Arc::new(JsonLinesExporter::new(config.export_dir.clone()));
    drive(context, exporter, SyncPlan::from(&config)).await
}

fn open_store(path: &Utf8Path) -> Result<SqliteStore, CliError> {
    ensure_parent_dir(path).map_err(|source| CliError::PrepareStore {
        path: path.to_path_buf(),
        source,
    })?;
    SqliteStore::open(path.as_std_path()).map_err(|source| CliError::OpenStore {
        path: path.to_path_buf(),
        source,
    })
}

/// Run the phases selected by `plan` within `context`.
pub(crate) async fn drive<S: VersionedStore + 'static>(
    context: SyncContext<S>,
    exporter: Arc<dyn FeatureExporter>,
    plan: SyncPlan,
) -> Result<SyncSummary, CliError> {
    let export = ExportCycle::new(context.clone(), exporter, Arc::new(LinkGeometryEncoder));
    let mut summary = SyncSummary::default();

    if plan.mode != SyncMode::Update {
        let report = BackfillCoordinator::new(context.clone()).run().await?;
        summary.backfilled = report.entities_written;
        summary.backfill_complete = report.is_complete();
        if !summary.backfill_complete {
            summary.interrupted = true;
            return Ok(summary);
        }
        export.mark_baseline().await?;
        if plan.mode == SyncMode::Backfill {
            return Ok(summary);
        }
    }

    let update = UpdateCoordinator::new(context.clone());
    loop {
        let report = update.run().await?;
        summary.cycles += 1;
        summary.changes += report.total_changes;
        if report.interrupted {
            summary.interrupted = true;
            break;
        }
        export.mark_baseline().await?;
        let exported = export.run(Utc::now()).await?;
        summary.absorb_export(&exported);

        if plan.once || plan.mode == SyncMode::Update {
            break;
        }
        tokio::select! {
            () = context.shutdown.cancelled() => break,
            () = tokio::time::sleep(plan.poll_interval) => {}
        }
    }
    if summary.interrupted {
        warn!("sync stopped before the current phase finished");
    }
    Ok(summary)
}

pub(crate) fn write_summary(writer: &mut dyn Write, summary: &SyncSummary) -> Result<(), CliError> {
    writeln!(
        writer,
        "backfilled {} entities; {} update cycles applied {} changes; {} features exported{}",
        summary.backfilled,
        summary.cycles,
        summary.changes,
        summary.exported,
        if summary.interrupted { " (interrupted)" } else { "" }
    )
    .map_err(CliError::WriteSummary)
}
