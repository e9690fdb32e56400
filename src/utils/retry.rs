//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Number of attempts made against one keyspace before giving up.
pub const KEYSPACE_FETCH_ATTEMPTS: usize = 3;

/// Backoff for coordination store reads under a keyspace prefix.
///
/// - Min delay: 50ms
/// - Max delay: 500ms
/// - Max attempts: 3 (two retries after the first attempt)
/// - Jitter enabled
pub fn keyspace_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(KEYSPACE_FETCH_ATTEMPTS - 1)
        .with_jitter()
}
