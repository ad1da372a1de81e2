//! Prometheus instruments derived from each [`Snapshot`].
//!
//! All instruments live in an explicitly passed [`Registry`]. Per-record
//! label sets (one series per backup or WAL segment) are reset and rebuilt on
//! every [`Metrics::update`], so series for records that disappeared from the
//! inventory do not linger. Timestamps and ages that are unknown for the
//! current snapshot are left out of the exposition rather than repeated from
//! an earlier cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};

use crate::model::inventory::seconds_between;
use crate::model::{BackupType, Snapshot, SourceKey};

const SCRAPE_BUCKETS: [f64; 9] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0];

/// `error_type` label used for failed collection steps.
pub const EXECUTION_ERROR: &str = "execution_error";

const NO_LABELS: &[&str] = &[];

pub struct Metrics {
    backup_info: GaugeVec,
    backup_size: GaugeVec,
    backup_duration: GaugeVec,
    backup_age: GaugeVec,
    backup_count: Gauge,
    last_backup_age: GaugeVec,
    last_full_backup_age: GaugeVec,

    wal_info: GaugeVec,
    wal_size: GaugeVec,
    wal_age: GaugeVec,
    wal_count: Gauge,
    last_wal_age: GaugeVec,

    lsn_delta_backup: GaugeVec,
    lsn_delta_wal: GaugeVec,

    pitr_window_hours: Gauge,
    pitr_earliest: GaugeVec,
    pitr_latest: GaugeVec,

    postgres_info: GaugeVec,
    postgres_in_recovery: Gauge,
    postgres_timeline: Gauge,

    command_errors: CounterVec,
    total_errors: Counter,
    last_error: GaugeVec,

    exporter_info: GaugeVec,
    scrape_success: Gauge,
    scrape_duration: Histogram,
    last_successful_scrape: Gauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// A gauge exported only while its value is known: `reset` removes the series.
fn optional_gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    gauge_vec(registry, name, help, NO_LABELS)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Metrics {
    /// Creates every instrument and registers it in `registry`.
    ///
    /// Fails if a family with the same name is already registered there.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let command_errors = CounterVec::new(
            Opts::new(
                "walg_command_errors_total",
                "Total number of errors from WAL-G commands",
            ),
            &["command", "error_type"],
        )?;
        registry.register(Box::new(command_errors.clone()))?;

        let total_errors = Counter::with_opts(Opts::new("walg_errors_total", "Total number of errors"))?;
        registry.register(Box::new(total_errors.clone()))?;

        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new(
                "walg_exporter_scrape_duration_seconds",
                "Duration of scrapes in seconds",
            )
            .buckets(SCRAPE_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        Ok(Self {
            backup_info: gauge_vec(
                registry,
                "walg_backup_info",
                "Information about WAL-G backups",
                &["backup_name", "backup_type", "hostname", "system_identifier", "is_permanent"],
            )?,
            backup_size: gauge_vec(
                registry,
                "walg_backup_size_bytes",
                "Size of WAL-G backup in bytes",
                &["backup_name", "backup_type", "size_type"],
            )?,
            backup_duration: gauge_vec(
                registry,
                "walg_backup_duration_seconds",
                "Duration of WAL-G backup in seconds",
                &["backup_name", "backup_type"],
            )?,
            backup_age: gauge_vec(
                registry,
                "walg_backup_age_seconds",
                "Age of WAL-G backup in seconds",
                &["backup_name", "backup_type"],
            )?,
            backup_count: gauge(registry, "walg_backup_count", "Total number of WAL-G backups")?,
            last_backup_age: optional_gauge(
                registry,
                "walg_last_backup_time_seconds",
                "Time since last backup in seconds",
            )?,
            last_full_backup_age: optional_gauge(
                registry,
                "walg_last_full_backup_time_seconds",
                "Time since last full backup in seconds",
            )?,

            wal_info: gauge_vec(
                registry,
                "walg_wal_info",
                "Information about WAL files",
                &["wal_file_name", "timeline"],
            )?,
            wal_size: gauge_vec(
                registry,
                "walg_wal_size_bytes",
                "Size of WAL file in bytes",
                &["wal_file_name", "timeline"],
            )?,
            wal_age: gauge_vec(
                registry,
                "walg_wal_age_seconds",
                "Age of WAL file in seconds",
                &["wal_file_name", "timeline"],
            )?,
            wal_count: gauge(registry, "walg_wal_count", "Total number of WAL files")?,
            last_wal_age: optional_gauge(
                registry,
                "walg_last_wal_time_seconds",
                "Time since last WAL push in seconds",
            )?,

            lsn_delta_backup: gauge_vec(
                registry,
                "walg_lsn_delta_backup_bytes",
                "LSN delta between current position and last backup in bytes",
                &["backup_type"],
            )?,
            lsn_delta_wal: gauge_vec(
                registry,
                "walg_lsn_delta_wal_bytes",
                "LSN delta between current position and last WAL push in bytes",
                &["timeline"],
            )?,

            pitr_window_hours: gauge(
                registry,
                "walg_pitr_window_size_hours",
                "Size of PITR window in hours",
            )?,
            pitr_earliest: optional_gauge(
                registry,
                "walg_pitr_earliest_time_seconds",
                "Earliest possible recovery time as Unix timestamp",
            )?,
            pitr_latest: optional_gauge(
                registry,
                "walg_pitr_latest_time_seconds",
                "Latest possible recovery time as Unix timestamp",
            )?,

            postgres_info: gauge_vec(
                registry,
                "walg_postgres_info",
                "Information about PostgreSQL instance",
                &[
                    "server_version",
                    "system_identifier",
                    "current_lsn",
                    "last_wal_received",
                    "last_wal_replayed",
                ],
            )?,
            postgres_in_recovery: gauge(
                registry,
                "walg_postgres_is_in_recovery",
                "Whether PostgreSQL is in recovery mode (1 = yes, 0 = no)",
            )?,
            postgres_timeline: gauge(
                registry,
                "walg_postgres_timeline",
                "Current PostgreSQL timeline",
            )?,

            command_errors,
            total_errors,
            last_error: gauge_vec(
                registry,
                "walg_last_error_time_seconds",
                "Time of last error as Unix timestamp",
                &["command", "error_type"],
            )?,

            exporter_info: gauge_vec(
                registry,
                "walg_exporter_info",
                "Information about the WAL-G exporter",
                &["version", "commit", "build_date"],
            )?,
            scrape_success: gauge(
                registry,
                "walg_exporter_scrape_success",
                "Whether the last scrape was successful (1 = yes, 0 = no)",
            )?,
            scrape_duration,
            last_successful_scrape: gauge(
                registry,
                "walg_exporter_last_successful_scrape_time_seconds",
                "Time of last successful scrape as Unix timestamp",
            )?,
        })
    }

    pub fn set_exporter_info(&self, version: &str, commit: &str, build_date: &str) {
        self.exporter_info.reset();
        self.exporter_info
            .with_label_values(&[version, commit, build_date])
            .set(1.0);
    }

    pub fn observe_collect_duration(&self, elapsed: Duration) {
        self.scrape_duration.observe(elapsed.as_secs_f64());
    }

    /// Counts one failure of `command` and marks the scrape unsuccessful.
    pub fn record_error(&self, command: &str, error_type: &str, at: DateTime<Utc>) {
        self.command_errors
            .with_label_values(&[command, error_type])
            .inc();
        self.total_errors.inc();
        self.last_error
            .with_label_values(&[command, error_type])
            .set(at.timestamp() as f64);
        self.scrape_success.set(0.0);
    }

    /// Rebuilds every snapshot-derived instrument from `snapshot`.
    pub fn update(&self, snapshot: &Snapshot) {
        let now = snapshot.captured_at.unwrap_or_else(Utc::now);

        for family in [
            &self.backup_info,
            &self.backup_size,
            &self.backup_duration,
            &self.backup_age,
            &self.wal_info,
            &self.wal_size,
            &self.wal_age,
            &self.lsn_delta_backup,
            &self.lsn_delta_wal,
            &self.last_backup_age,
            &self.last_full_backup_age,
            &self.last_wal_age,
            &self.pitr_earliest,
            &self.pitr_latest,
            &self.postgres_info,
            &self.last_error,
        ] {
            family.reset();
        }

        self.update_backups(snapshot, now);
        self.update_wal(snapshot, now);

        let backup_type = snapshot
            .backups
            .last()
            .map(|b| b.backup_type)
            .unwrap_or_default();
        self.lsn_delta_backup
            .with_label_values(&[backup_type.as_str()])
            .set(snapshot.lsn_delta.backup_delta as f64);
        let timeline = snapshot
            .wal_segments
            .last()
            .map(|w| w.timeline)
            .unwrap_or(i64::from(snapshot.replication.timeline));
        self.lsn_delta_wal
            .with_label_values(&[&timeline.to_string()])
            .set(snapshot.lsn_delta.wal_delta as f64);

        let window = &snapshot.recovery_window;
        self.pitr_window_hours.set(window.window_hours);
        if let Some(earliest) = window.earliest {
            self.pitr_earliest
                .with_label_values(NO_LABELS)
                .set(earliest.timestamp() as f64);
        }
        if let Some(latest) = window.latest {
            self.pitr_latest
                .with_label_values(NO_LABELS)
                .set(latest.timestamp() as f64);
        }

        if snapshot.error(SourceKey::PostgresInfo).is_none() {
            let state = &snapshot.replication;
            self.postgres_info
                .with_label_values(&[
                    &state.server_version,
                    &state.system_identifier,
                    &state.current_lsn,
                    &state.last_wal_received,
                    &state.last_wal_replayed,
                ])
                .set(1.0);
            self.postgres_in_recovery
                .set(if state.is_in_recovery { 1.0 } else { 0.0 });
            self.postgres_timeline.set(f64::from(state.timeline));
        }

        for key in snapshot.errors.keys() {
            self.record_error(key.as_str(), EXECUTION_ERROR, now);
        }

        if snapshot.is_healthy() {
            self.scrape_success.set(1.0);
            self.last_successful_scrape.set(now.timestamp() as f64);
        } else {
            self.scrape_success.set(0.0);
        }
    }

    fn update_backups(&self, snapshot: &Snapshot, now: DateTime<Utc>) {
        self.backup_count.set(snapshot.backups.len() as f64);

        let mut newest: Option<f64> = None;
        let mut newest_full: Option<f64> = None;
        for backup in &snapshot.backups {
            let name = backup.backup_name.as_str();
            let kind = backup.backup_type.as_str();
            self.backup_info
                .with_label_values(&[
                    name,
                    kind,
                    &backup.hostname,
                    &backup.system_identifier,
                    if backup.is_permanent { "true" } else { "false" },
                ])
                .set(1.0);

            for (size_type, size) in [
                ("data", backup.data_size),
                ("compressed", backup.compressed_size),
                ("uncompressed", backup.uncompressed_size),
            ] {
                self.backup_size
                    .with_label_values(&[name, kind, size_type])
                    .set(size as f64);
            }

            if let Some(duration) = backup.duration_secs() {
                self.backup_duration
                    .with_label_values(&[name, kind])
                    .set(duration);
            }

            if let Some(time) = backup.time {
                let age = seconds_between(time, now);
                self.backup_age.with_label_values(&[name, kind]).set(age);
                newest = Some(newest.map_or(age, |n| n.min(age)));
                if backup.backup_type == BackupType::Full {
                    newest_full = Some(newest_full.map_or(age, |n| n.min(age)));
                }
            }
        }

        if let Some(age) = newest {
            self.last_backup_age.with_label_values(NO_LABELS).set(age);
        }
        if let Some(age) = newest_full {
            self.last_full_backup_age
                .with_label_values(NO_LABELS)
                .set(age);
        }
    }

    fn update_wal(&self, snapshot: &Snapshot, now: DateTime<Utc>) {
        self.wal_count.set(snapshot.wal_segments.len() as f64);

        let mut newest: Option<f64> = None;
        for wal in &snapshot.wal_segments {
            let timeline = wal.timeline.to_string();
            let labels = [wal.wal_file_name.as_str(), timeline.as_str()];
            self.wal_info.with_label_values(&labels).set(1.0);
            self.wal_size
                .with_label_values(&labels)
                .set(wal.data_size as f64);

            if let Some(finish) = wal.finish_time {
                let age = seconds_between(finish, now);
                self.wal_age.with_label_values(&labels).set(age);
                newest = Some(newest.map_or(age, |n| n.min(age)));
            }
        }

        if let Some(age) = newest {
            self.last_wal_age.with_label_values(NO_LABELS).set(age);
        }
    }
}

/// Renders `registry` in the Prometheus text exposition format.
pub fn encode(registry: &Registry) -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
