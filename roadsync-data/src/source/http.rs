//! JSON-over-HTTP [`RoadDataSource`].
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call | Path |
//! |---|---|
//! | link sequence page | `road-link-sequences?start=&end=&after=&limit=` |
//! | road object page | `road-objects/{type}?start=&end=&after=&limit=` |
//! | events | `{stream path}/events?after=&limit=` |
//! | latest event id | `{stream path}/events/latest?as_of=` |
//!
//! Timeouts, connection failures, `429` and `5xx` responses are reported as
//! [`SourceError::Transient`] so [`crate::RetryingSource`] can back off.
//!
//! # Example
//!
//! ```no_run
//! use roadsync_data::source::HttpRoadSource;
//!
//! let source = HttpRoadSource::new("https://roads.example.com/api/v4/")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use roadsync_core::{
    EntityPage, EntityStream, EventPage, IdRange, RoadDataSource, RoadLinkSequence, RoadObject,
    SourceError, TypeId,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use super::wire::LatestEventResponse;

/// Default user agent for source requests.
pub const DEFAULT_USER_AGENT: &str = "roadsync/0.1";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Failures constructing an [`HttpRoadSource`].
#[derive(Debug, Error)]
pub enum SourceBuildError {
    /// The base URL does not parse.
    #[error("invalid source base URL {url}")]
    InvalidBaseUrl {
        /// Offending URL.
        url: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Settings for [`HttpRoadSource`].
#[derive(Debug, Clone)]
pub struct HttpRoadSourceConfig {
    /// Base URL of the API.
    pub base_url: String,
    /// Connect and request timeout.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl HttpRoadSourceConfig {
    /// Configuration for `base_url` with default timeout and user agent.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Road data API client.
#[derive(Debug, Clone)]
pub struct HttpRoadSource {
    client: Client,
    base: Url,
}

impl HttpRoadSource {
    /// Client for `base_url` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] when the URL is invalid or the client
    /// cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceBuildError> {
        Self::with_config(HttpRoadSourceConfig::new(base_url))
    }

    /// Client with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] when the URL is invalid or the client
    /// cannot be built.
    pub fn with_config(config: HttpRoadSourceConfig) -> Result<Self, SourceBuildError> {
        let mut raw = config.base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|source| SourceBuildError::InvalidBaseUrl {
            url: config.base_url.clone(),
            source,
        })?;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(SourceBuildError::HttpClient)?;
        Ok(Self { client, base })
    }

    fn stream_path(stream: EntityStream) -> String {
        match stream {
            EntityStream::LinkSequences => "road-link-sequences".to_owned(),
            EntityStream::Objects(type_id) => format!("road-objects/{type_id}"),
        }
    }

    fn endpoint(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Url, SourceError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|err| SourceError::InvalidRequest {
                operation,
                message: err.to_string(),
            })?;
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(key, value)| (*key, value.as_str())));
        Ok(url)
    }

    fn page_url(
        &self,
        stream: EntityStream,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<Url, SourceError> {
        let mut query = vec![
            ("start", range.start.to_string()),
            ("end", range.end.to_string()),
            ("limit", page_size.to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        self.endpoint("fetch entity page", &Self::stream_path(stream), &query)
    }

    fn events_url(
        &self,
        stream: EntityStream,
        cursor: u64,
        page_size: usize,
    ) -> Result<Url, SourceError> {
        self.endpoint(
            "fetch events",
            &format!("{}/events", Self::stream_path(stream)),
            &[
                ("after", cursor.to_string()),
                ("limit", page_size.to_string()),
            ],
        )
    }

    fn latest_url(&self, stream: EntityStream, as_of: DateTime<Utc>) -> Result<Url, SourceError> {
        self.endpoint(
            "fetch latest event id",
            &format!("{}/events/latest", Self::stream_path(stream)),
            &[("as_of", as_of.to_rfc3339_opts(SecondsFormat::Secs, true))],
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| convert_reqwest_error(&err, &url))?;
        let response = check_status(response, &url)?;
        response.json().await.map_err(|err| {
            if err.is_timeout() {
                convert_reqwest_error(&err, &url)
            } else {
                SourceError::Decode {
                    url: url.to_string(),
                    message: err.to_string(),
                }
            }
        })
    }
}

fn check_status(response: Response, url: &Url) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if is_transient_status(status) {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::Transient {
            url: url.to_string(),
            reason: format!("status {status}"),
            retry_after,
        });
    }
    Err(SourceError::Http {
        url: url.to_string(),
        status: status.as_u16(),
    })
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn convert_reqwest_error(error: &reqwest::Error, url: &Url) -> SourceError {
    if let Some(status) = error.status()
        && !is_transient_status(status)
    {
        return SourceError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        };
    }
    SourceError::Transient {
        url: url.to_string(),
        reason: error.to_string(),
        retry_after: None,
    }
}

#[async_trait]
impl RoadDataSource for HttpRoadSource {
    async fn link_sequences(
        &self,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadLinkSequence>, SourceError> {
        let url = self.page_url(EntityStream::LinkSequences, range, after, page_size)?;
        self.get_json(url).await
    }

    async fn road_objects(
        &self,
        type_id: TypeId,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadObject>, SourceError> {
        let url = self.page_url(EntityStream::Objects(type_id), range, after, page_size)?;
        self.get_json(url).await
    }

    async fn link_sequence_events(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadLinkSequence>, SourceError> {
        let url = self.events_url(EntityStream::LinkSequences, cursor, page_size)?;
        self.get_json(url).await
    }

    async fn road_object_events(
        &self,
        type_id: TypeId,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadObject>, SourceError> {
        let url = self.events_url(EntityStream::Objects(type_id), cursor, page_size)?;
        self.get_json(url).await
    }

    async fn latest_event_id(
        &self,
        stream: EntityStream,
        as_of: DateTime<Utc>,
    ) -> Result<u64, SourceError> {
        let url = self.latest_url(stream, as_of)?;
        let response: LatestEventResponse = self.get_json(url).await?;
        Ok(response.event_id.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::{fixture, rstest};

    #[fixture]
    fn source() -> HttpRoadSource {
        HttpRoadSource::new("https://roads.example.com/api/v4").expect("source should build")
    }

    #[rstest]
    fn page_urls_carry_range_and_cursor(source: HttpRoadSource) {
        let url = source
            .page_url(EntityStream::Objects(105), IdRange::new(0, 500), Some(42), 100)
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://roads.example.com/api/v4/road-objects/105?start=0&end=500&limit=100&after=42"
        );
    }

    #[rstest]
    fn first_pages_omit_the_cursor(source: HttpRoadSource) {
        let url = source
            .page_url(EntityStream::LinkSequences, IdRange::new(10, 20), None, 5)
            .expect("url");
        assert!(!url.as_str().contains("after="));
        assert!(url.path().ends_with("/road-link-sequences"));
    }

    #[rstest]
    fn latest_lookups_send_rfc3339_timestamps(source: HttpRoadSource) {
        let as_of = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        let url = source
            .latest_url(EntityStream::LinkSequences, as_of)
            .expect("url");
        assert_eq!(
            url.query(),
            Some("as_of=2024-05-01T12%3A00%3A00Z")
        );
    }

    #[rstest]
    #[case(StatusCode::TOO_MANY_REQUESTS, true)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, true)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, true)]
    #[case(StatusCode::NOT_FOUND, false)]
    #[case(StatusCode::BAD_REQUEST, false)]
    fn statuses_are_classified(#[case] status: StatusCode, #[case] transient: bool) {
        assert_eq!(is_transient_status(status), transient);
    }

    #[rstest]
    fn invalid_base_urls_are_rejected() {
        let err = HttpRoadSource::new("not a url").expect_err("invalid url");
        assert!(matches!(err, SourceBuildError::InvalidBaseUrl { .. }));
    }
}
