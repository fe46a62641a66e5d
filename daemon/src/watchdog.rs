use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::session::{SessionRegistry, SweepReport};

/// Sweep the registry every `tick` until it asks for an idle shutdown.
pub async fn run(registry: Arc<SessionRegistry>, tick: Duration) -> SweepReport {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let report = registry.sweep(tick).await;
        if !report.evicted.is_empty() {
            debug!(evicted = ?report.evicted, "Sweep evicted idle sessions");
        }
        if report.shutdown {
            info!(idle_secs = report.idle_for.as_secs(), "No sessions for too long, shutting down");
            return report;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySnapshotStore, RegistryConfig, SystemClock};
    use tokio::test;

    #[test(start_paused = true)]
    async fn test_returns_after_idle_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RegistryConfig::new(dir.path());
        config.idle_session_limit = Duration::from_secs(10);
        config.idle_shutdown_after = Duration::from_secs(20);
        let registry = Arc::new(SessionRegistry::new(
            config,
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(SystemClock),
        ));

        let started = tokio::time::Instant::now();
        let report = run(registry, Duration::from_secs(5)).await;
        assert!(report.shutdown);
        assert_eq!(report.idle_for, Duration::from_secs(25));
        // Keepalive expires on the second tick, shutdown comes four ticks later.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(35));
    }
}
