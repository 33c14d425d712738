//! Network adapters implementing [`roadsync_core::RoadDataSource`].

mod http;
mod wire;

pub use http::{DEFAULT_USER_AGENT, HttpRoadSource, HttpRoadSourceConfig, SourceBuildError};
