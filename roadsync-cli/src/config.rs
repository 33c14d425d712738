//! Arguments and resolved configuration for the `sync` and `reset-backfill`
//! subcommands.

use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use roadsync_core::{FeatureRules, TypeId};
use roadsync_data::{DEFAULT_ID_SPACE_END, SyncConfig};
use serde::{Deserialize, Serialize};

use crate::CliError;

pub(crate) const ARG_STORE: &str = "store";
pub(crate) const ARG_SOURCE_URL: &str = "source-url";
pub(crate) const ARG_OBJECT_TYPES: &str = "object-types";
pub(crate) const ARG_REQUIRE: &str = "require";
pub(crate) const ARG_EXPORT_DIR: &str = "export-dir";
pub(crate) const ARG_MODE: &str = "mode";
pub(crate) const ENV_STORE: &str = "ROADSYNC_CMDS_SYNC_STORE";
pub(crate) const ENV_SOURCE_URL: &str = "ROADSYNC_CMDS_SYNC_SOURCE_URL";
pub(crate) const ENV_EXPORT_DIR: &str = "ROADSYNC_CMDS_SYNC_EXPORT_DIR";
pub(crate) const ENV_RESET_STORE: &str = "ROADSYNC_CMDS_RESET_BACKFILL_STORE";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Which phases a `sync` invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SyncMode {
    /// Run the initial load only.
    Backfill,
    /// Run one update and export cycle.
    Update,
    /// Backfill when needed, then keep cycling until interrupted.
    #[default]
    Auto,
}

impl FromStr for SyncMode {
    type Err = CliError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backfill" => Ok(Self::Backfill),
            "update" => Ok(Self::Update),
            "auto" => Ok(Self::Auto),
            _ => Err(CliError::UnknownMode {
                value: value.to_owned(),
            }),
        }
    }
}

/// CLI arguments for the `sync` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "sync",
    long_about = "Replicate the road network into a local store and export \
                 change batches. Settings can come from CLI flags, \
                 configuration files, or environment variables.",
    about = "Backfill, update and export the road network replica"
)]
#[ortho_config(prefix = "ROADSYNC")]
pub(crate) struct SyncArgs {
    /// Phases to run: `backfill`, `update` or `auto`.
    #[arg(long = ARG_MODE, value_name = "mode")]
    #[serde(default)]
    pub(crate) mode: Option<String>,
    /// Path to the SQLite replica store.
    #[arg(long = ARG_STORE, value_name = "path")]
    #[serde(default)]
    pub(crate) store: Option<Utf8PathBuf>,
    /// Base URL of the road data API.
    #[arg(long = ARG_SOURCE_URL, value_name = "url")]
    #[serde(default)]
    pub(crate) source_url: Option<String>,
    /// Comma-separated road object types to replicate.
    #[arg(long = ARG_OBJECT_TYPES, value_name = "types")]
    #[serde(default)]
    pub(crate) object_types: Option<String>,
    /// Comma-separated `type=property` pairs a feature must carry.
    #[arg(long = ARG_REQUIRE, value_name = "rules")]
    #[serde(default)]
    pub(crate) require: Option<String>,
    /// Directory receiving exported change batches.
    #[arg(long = ARG_EXPORT_DIR, value_name = "dir")]
    #[serde(default)]
    pub(crate) export_dir: Option<Utf8PathBuf>,
    /// Backfill partitions per stream.
    #[arg(long, value_name = "count")]
    #[serde(default)]
    pub(crate) partitions: Option<u32>,
    /// Items requested per page.
    #[arg(long, value_name = "count")]
    #[serde(default)]
    pub(crate) page_size: Option<usize>,
    /// Concurrent backfill partitions.
    #[arg(long, value_name = "count")]
    #[serde(default)]
    pub(crate) workers: Option<usize>,
    /// Exclusive upper bound of entity ids.
    #[arg(long, value_name = "id")]
    #[serde(default)]
    pub(crate) id_space_end: Option<u64>,
    /// Seconds to wait between cycles in `auto` mode.
    #[arg(long, value_name = "secs")]
    #[serde(default)]
    pub(crate) poll_interval_secs: Option<u64>,
    /// Stop `auto` mode after a single cycle.
    #[arg(long)]
    #[serde(default)]
    pub(crate) once: bool,
}

impl SyncArgs {
    pub(crate) fn into_config(self) -> Result<SyncRunConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        SyncRunConfig::try_from(merged)
    }
}

/// Resolved `sync` configuration.
#[derive(Debug, Clone)]
pub(crate) struct SyncRunConfig {
    pub(crate) mode: SyncMode,
    pub(crate) store: Utf8PathBuf,
    pub(crate) source_url: String,
    pub(crate) export_dir: Utf8PathBuf,
    pub(crate) poll_interval: Duration,
    pub(crate) once: bool,
    pub(crate) engine: SyncConfig,
}

impl TryFrom<SyncArgs> for SyncRunConfig {
    type Error = CliError;

    fn try_from(args: SyncArgs) -> Result<Self, Self::Error> {
        let store = args.store.ok_or(CliError::MissingArgument {
            field: ARG_STORE,
            env: ENV_STORE,
        })?;
        let source_url = args.source_url.ok_or(CliError::MissingArgument {
            field: ARG_SOURCE_URL,
            env: ENV_SOURCE_URL,
        })?;
        let export_dir = args.export_dir.ok_or(CliError::MissingArgument {
            field: ARG_EXPORT_DIR,
            env: ENV_EXPORT_DIR,
        })?;
        let mode = args
            .mode
            .as_deref()
            .map(SyncMode::from_str)
            .transpose()?
            .unwrap_or_default();

        let mut engine = SyncConfig::default()
            .with_object_types(parse_object_types(args.object_types.as_deref())?)
            .with_rules(parse_rules(args.require.as_deref())?)
            .with_id_space_end(args.id_space_end.unwrap_or(DEFAULT_ID_SPACE_END));
        if let Some(partitions) = args.partitions {
            engine = engine.with_partitions(partitions);
        }
        if let Some(page_size) = args.page_size {
            engine = engine.with_page_size(page_size);
        }
        if let Some(workers) = args.workers {
            engine = engine.with_max_workers(workers);
        }
        engine.validate()?;

        Ok(Self {
            mode,
            store,
            source_url,
            export_dir,
            poll_interval: Duration::from_secs(
                args.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            once: args.once,
            engine,
        })
    }
}

/// CLI arguments for the `reset-backfill` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "reset-backfill",
    about = "Forget backfill progress so the next sync starts the initial load over"
)]
#[ortho_config(prefix = "ROADSYNC")]
pub(crate) struct ResetArgs {
    /// Path to the SQLite replica store.
    #[arg(long = ARG_STORE, value_name = "path")]
    #[serde(default)]
    pub(crate) store: Option<Utf8PathBuf>,
}

impl ResetArgs {
    pub(crate) fn into_store_path(self) -> Result<Utf8PathBuf, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        merged.store.ok_or(CliError::MissingArgument {
            field: ARG_STORE,
            env: ENV_RESET_STORE,
        })
    }
}

fn parse_object_types(raw: Option<&str>) -> Result<Vec<TypeId>, CliError> {
    split_list(raw)
        .map(|item| {
            item.parse().map_err(|_| CliError::InvalidListItem {
                field: ARG_OBJECT_TYPES,
                item: item.to_owned(),
            })
        })
        .collect()
}

fn parse_rules(raw: Option<&str>) -> Result<FeatureRules, CliError> {
    split_list(raw).try_fold(FeatureRules::default(), |rules, item| {
        let invalid = || CliError::InvalidListItem {
            field: ARG_REQUIRE,
            item: item.to_owned(),
        };
        let (type_id, property) = item.split_once('=').ok_or_else(invalid)?;
        let type_id: TypeId = type_id.trim().parse().map_err(|_| invalid())?;
        let property = property.trim();
        if property.is_empty() {
            return Err(invalid());
        }
        Ok(rules.require(type_id, [property]))
    })
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}
