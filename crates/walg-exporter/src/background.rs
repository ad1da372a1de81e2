//! Background collection loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use walg_exporter_core::collector::{Collector, ReplicationSource};
use walg_exporter_core::metrics::Metrics;
use walg_exporter_core::model::Snapshot;
use walg_exporter_core::publish::SnapshotPublisher;

/// Collects one snapshot per `interval` until `shutdown` flips to `true`.
///
/// The first cycle starts immediately. A cycle in flight when shutdown
/// arrives is dropped, which kills any wal-g child it spawned.
pub(crate) async fn collect_loop<S: ReplicationSource>(
    collector: Collector<S>,
    metrics: Arc<Metrics>,
    publisher: SnapshotPublisher,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cycle_count: u64 = 0;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }

        let snapshot = tokio::select! {
            snapshot = run_cycle(&collector, &metrics, &publisher, timeout) => snapshot,
            _ = shutdown.changed() => break,
        };

        cycle_count += 1;
        let elapsed = snapshot.timing.total;
        if cycle_count == 1 {
            info!(
                duration_ms = elapsed.as_millis() as u64,
                backups = snapshot.backups.len(),
                wal_segments = snapshot.wal_segments.len(),
                errors = snapshot.errors.len(),
                "first snapshot collected"
            );
        } else {
            debug!(
                duration_ms = elapsed.as_millis() as u64,
                cycle_count,
                "collection cycle completed"
            );
        }

        if elapsed > interval / 2 {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "collection exceeded 50% of interval"
            );
        }
    }

    info!(cycle_count, "collection loop stopped");
}

/// One cycle: collect, refresh instruments, hand the snapshot to readers.
pub(crate) async fn run_cycle<S: ReplicationSource>(
    collector: &Collector<S>,
    metrics: &Metrics,
    publisher: &SnapshotPublisher,
    timeout: Duration,
) -> Arc<Snapshot> {
    let snapshot = collector.collect_with_timeout(timeout).await;
    metrics.update(&snapshot);

    if !snapshot.is_healthy() {
        let failed: Vec<&str> = snapshot.errors.keys().map(|k| k.as_str()).collect();
        warn!(failed = ?failed, "collection cycle finished with errors");
    }

    publisher.publish(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use walg_exporter_core::collector::InventoryFetcher;
    use walg_exporter_core::collector::mock::MockSource;
    use walg_exporter_core::model::SourceKey;
    use walg_exporter_core::publish;

    fn fetcher(script: &str) -> InventoryFetcher {
        InventoryFetcher::new("sh").with_prefix_args(["-c", script, "wal-g"])
    }

    fn collector(script: &str) -> (Collector<MockSource>, Arc<Metrics>, Registry) {
        let registry = Registry::new();
        let metrics = Arc::new(Metrics::new(&registry).unwrap());
        let collector = Collector::new(
            MockSource::primary("0/3000000"),
            fetcher(script),
            Arc::clone(&metrics),
        );
        (collector, metrics, registry)
    }

    #[tokio::test]
    async fn cycle_publishes_and_updates_metrics() {
        let (collector, metrics, registry) = collector("echo '[]'");
        let (publisher, reader) = publish::channel();

        let snapshot = run_cycle(&collector, &metrics, &publisher, Duration::from_secs(10)).await;
        assert!(snapshot.is_healthy(), "errors: {:?}", snapshot.errors);
        assert!(Arc::ptr_eq(&snapshot, &reader.latest().unwrap()));

        let text = walg_exporter_core::metrics::encode(&registry).unwrap();
        assert!(text.contains("walg_exporter_scrape_success 1"));
    }

    #[tokio::test]
    async fn failing_cycle_is_still_published() {
        let (collector, metrics, _registry) = collector("exit 3");
        let (publisher, reader) = publish::channel();

        run_cycle(&collector, &metrics, &publisher, Duration::from_secs(10)).await;
        let latest = reader.latest().unwrap();
        assert!(latest.error(SourceKey::BackupList).is_some());
        assert!(latest.error(SourceKey::WalInfo).is_some());
        assert_eq!(latest.replication.current_lsn, "0/3000000");
    }

    #[tokio::test]
    async fn loop_runs_immediately_and_stops_on_shutdown() {
        let (collector, metrics, _registry) = collector("echo '[]'");
        let (publisher, mut reader) = publish::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(collect_loop(
            collector,
            metrics,
            publisher,
            Duration::from_secs(3600),
            Duration::from_secs(10),
            shutdown_rx,
        ));

        let first = tokio::time::timeout(Duration::from_secs(10), reader.changed())
            .await
            .unwrap();
        assert!(first.is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_abandons_cycle_in_flight() {
        let (collector, metrics, _registry) = collector("exec sleep 30");
        let (publisher, reader) = publish::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(collect_loop(
            collector,
            metrics,
            publisher,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(reader.latest().is_none());
    }
}
