//! Periodic stats reporting for readers and writers.
//!
//! Readers and writers expose counters through [`StatsProvider`]; one
//! background task per provider logs them every period. The task holds only
//! a weak reference and stops once the provider is gone or the owning queue
//! shuts down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Source of named counters.
pub trait StatsProvider: Send + Sync {
    /// "reader" or "writer".
    fn stats_kind(&self) -> &'static str;

    fn stats_topic(&self) -> &str;

    fn stats_snapshot(&self) -> Vec<(&'static str, u64)>;
}

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Start reporting `provider` every `period`. A zero period disables it.
pub fn spawn_stats_logger(
    provider: Weak<dyn StatsProvider>,
    period: Duration,
    shutdown: CancellationToken,
) {
    if period.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(provider) = provider.upgrade() else {
                        break;
                    };
                    log_snapshot(provider.as_ref());
                }
            }
        }
        debug!("Stats logger stopped");
    });
}

fn log_snapshot(provider: &dyn StatsProvider) {
    let counters = provider
        .stats_snapshot()
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ");
    info!(
        kind = provider.stats_kind(),
        topic = %provider.stats_topic(),
        stats = %counters,
        "Stats"
    );
}
