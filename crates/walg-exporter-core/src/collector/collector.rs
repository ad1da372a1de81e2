//! Snapshot aggregator.
//!
//! Runs the collection steps in order under one deadline and isolates their
//! failures, so a broken source never hides the healthy ones.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error};

use super::{
    CollectError, InventoryFetcher, InventoryRecord, ReplicationSource, bounded, compute_lsn_delta,
    recovery_window,
};
use crate::metrics::Metrics;
use crate::model::{BackupRecord, Snapshot, SourceKey, WalSegmentRecord};

/// Builds one [`Snapshot`] per call from the replication source and wal-g.
pub struct Collector<S: ReplicationSource> {
    source: S,
    fetcher: InventoryFetcher,
    metrics: Arc<Metrics>,
}

impl<S: ReplicationSource> Collector<S> {
    pub fn new(source: S, fetcher: InventoryFetcher, metrics: Arc<Metrics>) -> Self {
        Self {
            source,
            fetcher,
            metrics,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Collects with a deadline `timeout` from now.
    pub async fn collect_with_timeout(&self, timeout: Duration) -> Snapshot {
        self.collect(Instant::now() + timeout).await
    }

    /// Collects a snapshot, never failing as a whole.
    ///
    /// Steps run in order: replication state, backup list, WAL list, LSN
    /// deltas, PITR window. A failed step leaves its fields at their zero
    /// values and records the failure under its key. Once `deadline` has
    /// passed, the remaining steps are skipped and recorded as timed out.
    pub async fn collect(&self, deadline: Instant) -> Snapshot {
        let started = Instant::now();
        let mut snapshot = Snapshot::new(Utc::now());

        if let Some(state) = run_step(
            &mut snapshot,
            SourceKey::PostgresInfo,
            deadline,
            self.source.replication_state(deadline),
        )
        .await
        {
            snapshot.replication = state;
        }

        if let Some(backups) = run_step(
            &mut snapshot,
            BackupRecord::SOURCE,
            deadline,
            self.fetcher.fetch::<BackupRecord>(deadline),
        )
        .await
        {
            snapshot.backups = backups;
        }

        if let Some(wal_segments) = run_step(
            &mut snapshot,
            WalSegmentRecord::SOURCE,
            deadline,
            self.fetcher.fetch::<WalSegmentRecord>(deadline),
        )
        .await
        {
            snapshot.wal_segments = wal_segments;
        }

        let step_started = Instant::now();
        let outcome = guard(deadline, async {
            Ok(compute_lsn_delta(
                &self.source,
                &snapshot.replication.current_lsn,
                &snapshot.backups,
                &snapshot.wal_segments,
                deadline,
            )
            .await)
        })
        .await;
        let outcome = match outcome {
            Ok((delta, failure)) => {
                snapshot.lsn_delta = delta;
                failure.map_or(Ok(()), Err)
            }
            Err(e) => Err(e),
        };
        settle(&mut snapshot, SourceKey::LsnDelta, step_started, outcome);

        let step_started = Instant::now();
        let outcome = guard(deadline, async {
            Ok(recovery_window(&snapshot.backups, &snapshot.wal_segments))
        })
        .await;
        if let Some(window) = settle(&mut snapshot, SourceKey::PitrWindow, step_started, outcome) {
            snapshot.recovery_window = window;
        }

        let elapsed = started.elapsed();
        snapshot.timing.total = elapsed;
        self.metrics.observe_collect_duration(elapsed);

        debug!(
            duration_ms = elapsed.as_millis() as u64,
            backups = snapshot.backups.len(),
            wal_segments = snapshot.wal_segments.len(),
            errors = snapshot.errors.len(),
            "snapshot collected"
        );
        snapshot
    }
}

/// Runs one step and folds its outcome into `snapshot`.
async fn run_step<T, F>(
    snapshot: &mut Snapshot,
    key: SourceKey,
    deadline: Instant,
    fut: F,
) -> Option<T>
where
    F: Future<Output = Result<T, CollectError>>,
{
    let step_started = Instant::now();
    let outcome = guard(deadline, fut).await;
    settle(snapshot, key, step_started, outcome)
}

/// Bounds `fut` by `deadline`, skipping it entirely if the deadline already passed.
async fn guard<T, F>(deadline: Instant, fut: F) -> Result<T, CollectError>
where
    F: Future<Output = Result<T, CollectError>>,
{
    if Instant::now() >= deadline {
        return Err(CollectError::DeadlineExceeded);
    }
    bounded(deadline, fut).await
}

fn settle<T>(
    snapshot: &mut Snapshot,
    key: SourceKey,
    step_started: Instant,
    outcome: Result<T, CollectError>,
) -> Option<T> {
    snapshot.timing.record(key, step_started.elapsed());
    match outcome {
        Ok(value) => Some(value),
        Err(e) => {
            error!(source = %key, error = %e, "collection step failed");
            snapshot.errors.insert(key, e.to_string());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::inventory::tests::scripted;
    use crate::collector::mock::MockSource;
    use crate::model::BackupType;
    use prometheus::Registry;

    const BACKUPS: &str = r#"[{"backup_name":"backup_full_1","finish_lsn":"0/5000000","start_time":"2024-03-01T00:00:00Z","finish_time":"2024-03-01T01:00:00Z"},{"backup_name":"backup_incr_2","finish_lsn":"0/7000000","start_time":"2024-03-01T06:00:00Z","finish_time":"2024-03-01T06:30:00Z"}]"#;
    const WALS: &str = r#"[{"wal_file_name":"000000010000000000000008","finish_lsn":"0/8000000","finish_time":"2024-03-01T09:00:00Z","timeline":1}]"#;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&Registry::new()).unwrap())
    }

    /// wal-g stand-in answering each subcommand with the given shell snippet.
    fn walg(backup_list: &str, wal_show: &str) -> InventoryFetcher {
        scripted(&format!(
            "case \"$1\" in\nbackup-list) {backup_list} ;;\nwal-show) {wal_show} ;;\n*) exit 64 ;;\nesac"
        ))
    }

    fn print(json: &str) -> String {
        format!("echo '{json}'")
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn healthy_sources_fill_every_field() {
        let source = MockSource::primary("0/9000000")
            .with_diff("0/9000000", "0/7000000", 33_554_432)
            .with_diff("0/9000000", "0/8000000", 16_777_216);
        let collector = Collector::new(source, walg(&print(BACKUPS), &print(WALS)), metrics());

        let snapshot = collector.collect(in_secs(10)).await;
        assert!(snapshot.errors.is_empty(), "errors: {:?}", snapshot.errors);
        assert_eq!(snapshot.replication.current_lsn, "0/9000000");
        assert_eq!(snapshot.backups.len(), 2);
        assert_eq!(snapshot.backups[1].backup_type, BackupType::Incremental);
        assert_eq!(snapshot.wal_segments.len(), 1);
        assert_eq!(snapshot.lsn_delta.backup_delta, 33_554_432);
        assert_eq!(snapshot.lsn_delta.wal_delta, 16_777_216);
        assert!((snapshot.recovery_window.window_hours - 9.0).abs() < 1e-9);
        assert!(snapshot.captured_at.is_some());
        assert!(snapshot.timing.total >= snapshot.timing.backup_list);
    }

    #[tokio::test]
    async fn backup_failure_is_isolated() {
        let source = MockSource::primary("0/9000000")
            .with_diff("0/9000000", "0/8000000", 16_777_216);
        let collector = Collector::new(
            source,
            walg("echo 'access denied' >&2; exit 1", &print(WALS)),
            metrics(),
        );

        let snapshot = collector.collect(in_secs(10)).await;
        assert_eq!(snapshot.errors.len(), 1, "errors: {:?}", snapshot.errors);
        let message = snapshot.error(SourceKey::BackupList).unwrap();
        assert!(message.contains("access denied"), "message: {message}");
        assert_eq!(snapshot.replication.current_lsn, "0/9000000");
        assert!(snapshot.backups.is_empty());
        assert_eq!(snapshot.wal_segments.len(), 1);
        assert_eq!(snapshot.lsn_delta.backup_delta, 0);
        assert_eq!(snapshot.lsn_delta.wal_delta, 16_777_216);
    }

    #[tokio::test]
    async fn database_outage_keeps_inventory() {
        let collector = Collector::new(
            MockSource::unavailable("connection refused"),
            walg(&print(BACKUPS), &print(WALS)),
            metrics(),
        );

        let snapshot = collector.collect(in_secs(10)).await;
        assert!(snapshot.error(SourceKey::PostgresInfo).is_some());
        assert_eq!(
            snapshot.error(SourceKey::LsnDelta),
            Some("no current LSN available")
        );
        assert_eq!(snapshot.replication, Default::default());
        assert_eq!(snapshot.backups.len(), 2);
        assert_eq!(snapshot.wal_segments.len(), 1);
        assert!(snapshot.recovery_window.latest.is_some());
        assert_eq!(snapshot.error(SourceKey::PitrWindow), None);
    }

    #[tokio::test]
    async fn expired_deadline_skips_remaining_steps() {
        let source = MockSource::primary("0/9000000").with_delay(Duration::from_millis(300));
        let collector = Collector::new(source, walg(&print(BACKUPS), &print(WALS)), metrics());

        let snapshot = collector
            .collect(Instant::now() + Duration::from_millis(50))
            .await;
        for key in SourceKey::ALL {
            assert_eq!(
                snapshot.error(key),
                Some("deadline exceeded"),
                "key: {key}"
            );
        }
        assert!(snapshot.backups.is_empty());
        assert_eq!(snapshot.recovery_window, Default::default());
    }

    #[tokio::test]
    async fn hung_inventory_command_is_cut_off() {
        let collector = Collector::new(
            MockSource::primary("0/9000000"),
            walg("exec sleep 30", &print(WALS)),
            metrics(),
        );

        let started = std::time::Instant::now();
        let snapshot = collector
            .collect(Instant::now() + Duration::from_millis(500))
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(snapshot.error(SourceKey::BackupList), Some("deadline exceeded"));
        assert_eq!(snapshot.error(SourceKey::WalInfo), Some("deadline exceeded"));
        assert_eq!(snapshot.replication.current_lsn, "0/9000000");
    }

    #[tokio::test]
    async fn collect_observes_duration() {
        let registry = Registry::new();
        let metrics = Arc::new(Metrics::new(&registry).unwrap());
        let collector = Collector::new(
            MockSource::primary("0/9000000"),
            walg("echo '[]'", "echo '[]'"),
            metrics,
        );
        collector.collect(in_secs(10)).await;

        let family = registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "walg_exporter_scrape_duration_seconds")
            .unwrap();
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
    }
}
