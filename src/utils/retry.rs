//! Backoff builders shared by connection, publish and consumer retries.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::queue::QueueError;
use crate::store::StoreError;

/// Backoff for store and queue connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 10
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Backoff for a single queue publish.
///
/// - Min delay: 100ms
/// - Max delay: 2s
/// - Max attempts: `attempts`
/// - Jitter enabled
pub fn publish_backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(attempts)
        .with_jitter()
}

/// Backoff between queue consumer resubscriptions. Unbounded; callers fall
/// back to [`RECONNECT_MAX_DELAY`] once it stops yielding.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(RECONNECT_MAX_DELAY)
        .with_jitter()
}

pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Whether a store error is worth retrying at startup.
///
/// Only connection failures are; command and conversion errors will fail
/// the same way again.
pub fn is_retryable_store_error(error: &StoreError) -> bool {
    error.is_connection()
}

/// Whether a queue publish is worth retrying.
///
/// A declaration refused by the broker, such as a queue that exists with
/// other arguments, fails the same way on every attempt.
pub fn is_retryable_queue_error(error: &QueueError) -> bool {
    matches!(error, QueueError::Connection(_) | QueueError::Publish(_))
}
