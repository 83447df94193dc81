//! Backoff builders.
//!
//! Uses `backon` for both the fixed commit retry of the Kafka readers and
//! the exponential connection retry of the NATS backend.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

/// Total commit attempts per message, first included.
pub const COMMIT_ATTEMPTS: usize = 3;

/// Offset commit retry: immediate, [`COMMIT_ATTEMPTS`] attempts in total.
pub fn commit_backoff() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::ZERO)
        .with_max_times(COMMIT_ATTEMPTS - 1)
}

/// Backoff for broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
