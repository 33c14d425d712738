//! Bounded exponential backoff for transient source failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use rand::{Rng, thread_rng};
use roadsync_core::{
    EntityPage, EntityStream, EventPage, IdRange, RoadDataSource, RoadLinkSequence, RoadObject,
    SourceError, TypeId,
};

/// Backoff settings applied to each source call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(0.2)
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times in total, doubling from `base_delay`.
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::MAX,
            jitter_fraction: 0.0,
        }
    }

    /// Never retry.
    #[must_use]
    pub fn none() -> Self {
        Self::exponential(1, Duration::ZERO)
    }

    /// Cap individual delays at `max_delay`.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Randomise each delay by up to `fraction` in either direction.
    #[must_use]
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (starting at one).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1_u32 << shift);
        let bounded = raw.min(self.max_delay);
        if self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor = thread_rng()
            .gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        bounded.mul_f64(factor)
    }

    /// Run `call` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// A `retry_after` hint on a transient error replaces the computed delay
    /// when it is longer.
    ///
    /// # Errors
    ///
    /// Returns non-transient errors unchanged and wraps the final transient
    /// error in [`SourceError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SourceError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    return Err(SourceError::RetriesExhausted {
                        operation,
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let mut delay = self.delay_for_attempt(attempt);
                    if let SourceError::Transient {
                        retry_after: Some(hint),
                        ..
                    } = &err
                    {
                        delay = delay.max(*hint).min(self.max_delay);
                    }
                    warn!(
                        "{operation} attempt {attempt}/{} failed, retrying in {delay:?}: {err}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// [`RoadDataSource`] decorator retrying transient failures.
#[derive(Debug)]
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingSource<S> {
    /// Wrap `inner` with `policy`.
    #[must_use]
    pub const fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped source.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RoadDataSource> RoadDataSource for RetryingSource<S> {
    async fn link_sequences(
        &self,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadLinkSequence>, SourceError> {
        self.policy
            .run("fetch link sequences", || {
                self.inner.link_sequences(range, after, page_size)
            })
            .await
    }

    async fn road_objects(
        &self,
        type_id: TypeId,
        range: IdRange,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<EntityPage<RoadObject>, SourceError> {
        self.policy
            .run("fetch road objects", || {
                self.inner.road_objects(type_id, range, after, page_size)
            })
            .await
    }

    async fn link_sequence_events(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadLinkSequence>, SourceError> {
        self.policy
            .run("fetch link sequence events", || {
                self.inner.link_sequence_events(cursor, page_size)
            })
            .await
    }

    async fn road_object_events(
        &self,
        type_id: TypeId,
        cursor: u64,
        page_size: usize,
    ) -> Result<EventPage<RoadObject>, SourceError> {
        self.policy
            .run("fetch road object events", || {
                self.inner.road_object_events(type_id, cursor, page_size)
            })
            .await
    }

    async fn latest_event_id(
        &self,
        stream: EntityStream,
        as_of: DateTime<Utc>,
    ) -> Result<u64, SourceError> {
        self.policy
            .run("fetch latest event id", || {
                self.inner.latest_event_id(stream, as_of)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubSource, block_on_for_tests};
    use rstest::rstest;

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(6, 1_000)]
    fn delays_double_up_to_the_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(
            policy.delay_for_attempt(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[rstest]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1_000)).with_jitter(0.25);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(750) && delay <= Duration::from_millis(1_250));
        }
    }

    #[rstest]
    fn transient_failures_are_retried_until_success() {
        let stub = StubSource::default();
        stub.fail_next_calls(2);
        let source = RetryingSource::new(stub, RetryPolicy::exponential(3, Duration::ZERO));
        let latest = block_on_for_tests(source.latest_event_id(EntityStream::LinkSequences, Utc::now()));
        assert_eq!(latest.expect("third attempt succeeds"), 0);
    }

    #[rstest]
    fn exhausted_retries_surface_the_last_error() {
        let stub = StubSource::default();
        stub.fail_next_calls(5);
        let source = RetryingSource::new(stub, RetryPolicy::exponential(2, Duration::ZERO));
        let err = block_on_for_tests(source.latest_event_id(EntityStream::LinkSequences, Utc::now()))
            .expect_err("retries exhausted");
        assert!(matches!(err, SourceError::RetriesExhausted { attempts: 2, .. }));
    }
}
