//! Engine configuration shared by the coordinators.

use chrono::TimeDelta;
use roadsync_core::{FeatureRules, TypeId};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Upper bound of the id space when none is configured.
pub const DEFAULT_ID_SPACE_END: u64 = 1 << 40;

/// Settings for backfill, update and export cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Road object types to replicate.
    pub object_types: Vec<TypeId>,
    /// Number of backfill partitions per stream.
    pub partitions: u32,
    /// Exclusive upper bound of entity ids.
    pub id_space_end: u64,
    /// Entities or events requested per page.
    pub page_size: usize,
    /// Maximum concurrent backfill partitions.
    pub max_workers: usize,
    /// How long superseded links are kept after their validity ends.
    pub link_retention: TimeDelta,
    /// Backoff applied to source calls.
    pub retry: RetryPolicy,
    /// Properties required per object type for a feature to be exportable.
    pub rules: FeatureRules,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            object_types: Vec::new(),
            partitions: 4,
            id_space_end: DEFAULT_ID_SPACE_END,
            page_size: 1_000,
            max_workers: 4,
            link_retention: TimeDelta::days(30),
            retry: RetryPolicy::default(),
            rules: FeatureRules::default(),
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting must be positive.
    #[error("{field} must be greater than zero")]
    NotPositive {
        /// Offending setting.
        field: &'static str,
    },
    /// An object type was listed twice.
    #[error("object type {type_id} is configured more than once")]
    DuplicateType {
        /// Repeated type.
        type_id: TypeId,
    },
    /// The retention window is negative.
    #[error("link retention must not be negative")]
    NegativeRetention,
}

impl SyncConfig {
    /// Replicate `types`.
    #[must_use]
    pub fn with_object_types(mut self, types: impl IntoIterator<Item = TypeId>) -> Self {
        self.object_types = types.into_iter().collect();
        self
    }

    /// Split backfill into `partitions` ranges per stream.
    #[must_use]
    pub const fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Bound the id space at `end` (exclusive).
    #[must_use]
    pub const fn with_id_space_end(mut self, end: u64) -> Self {
        self.id_space_end = end;
        self
    }

    /// Request `page_size` items per page.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Run at most `workers` backfill partitions at once.
    #[must_use]
    pub const fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Keep superseded links for `retention`.
    #[must_use]
    pub const fn with_link_retention(mut self, retention: TimeDelta) -> Self {
        self.link_retention = retention;
        self
    }

    /// Apply `retry` to source calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use `rules` when rebuilding features.
    #[must_use]
    pub fn with_rules(mut self, rules: FeatureRules) -> Self {
        self.rules = rules;
        self
    }

    /// Check the settings for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("partitions", u64::from(self.partitions)),
            ("id space end", self.id_space_end),
            ("page size", self.page_size as u64),
            ("max workers", self.max_workers as u64),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NotPositive { field });
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some(&type_id) = self.object_types.iter().find(|t| !seen.insert(**t)) {
            return Err(ConfigError::DuplicateType { type_id });
        }
        if self.link_retention < TimeDelta::zero() {
            return Err(ConfigError::NegativeRetention);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_are_valid() {
        assert_eq!(SyncConfig::default().validate(), Ok(()));
    }

    #[rstest]
    #[case(SyncConfig::default().with_partitions(0), "partitions")]
    #[case(SyncConfig::default().with_page_size(0), "page size")]
    #[case(SyncConfig::default().with_max_workers(0), "max workers")]
    fn zero_values_are_rejected(#[case] config: SyncConfig, #[case] field: &'static str) {
        assert_eq!(config.validate(), Err(ConfigError::NotPositive { field }));
    }

    #[rstest]
    fn duplicate_types_are_rejected() {
        let config = SyncConfig::default().with_object_types([105, 581, 105]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateType { type_id: 105 })
        );
    }
}
