//! Error types emitted by the roadsync CLI.
//!
//! Coordinator errors are boxed so `Result<_, CliError>` stays small.

use std::sync::Arc;

use camino::Utf8PathBuf;
use roadsync_core::store::StoreError;
use roadsync_data::{
    BackfillError, ConfigError, ExportCycleError, SourceBuildError, UpdateError,
};
use thiserror::Error;

/// Errors emitted by the roadsync CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// The `--mode` value is not recognised.
    #[error("unknown sync mode {value:?} (expected backfill, update or auto)")]
    UnknownMode { value: String },
    /// An entry of a comma-separated option could not be parsed.
    #[error("invalid {field} entry {item:?}")]
    InvalidListItem { field: &'static str, item: String },
    /// The merged engine settings are inconsistent.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    /// The store directory could not be created.
    #[error("failed to prepare store directory for {path:?}: {source}")]
    PrepareStore {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Opening the replica store failed.
    #[error("failed to open store {path:?}: {source}")]
    OpenStore {
        path: Utf8PathBuf,
        #[source]
        source: StoreError,
    },
    /// Clearing backfill progress failed.
    #[error("failed to reset backfill in {path:?}: {source}")]
    ResetBackfill {
        path: Utf8PathBuf,
        #[source]
        source: StoreError,
    },
    /// Constructing the road data source failed.
    #[error(transparent)]
    SourceBuild(Box<SourceBuildError>),
    /// The async runtime could not be started.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// Backfill failed.
    #[error("backfill failed: {0}")]
    Backfill(#[source] Box<BackfillError>),
    /// An update cycle failed.
    #[error("update cycle failed: {0}")]
    Update(#[source] Box<UpdateError>),
    /// An export cycle failed.
    #[error("export cycle failed: {0}")]
    ExportCycle(#[source] Box<ExportCycleError>),
    /// Writing the run summary failed.
    #[error("failed to write summary: {0}")]
    WriteSummary(#[source] std::io::Error),
}

impl From<SourceBuildError> for CliError {
    fn from(err: SourceBuildError) -> Self {
        Self::SourceBuild(Box::new(err))
    }
}

impl From<BackfillError> for CliError {
    fn from(err: BackfillError) -> Self {
        Self::Backfill(Box::new(err))
    }
}

impl From<UpdateError> for CliError {
    fn from(err: UpdateError) -> Self {
        Self::Update(Box::new(err))
    }
}

impl From<ExportCycleError> for CliError {
    fn from(err: ExportCycleError) -> Self {
        Self::ExportCycle(Box::new(err))
    }
}
