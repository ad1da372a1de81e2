//! Backup and WAL inventory records as reported by wal-g.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::de;

/// Backup classification inferred from the backup name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
}

impl BackupType {
    /// Classifies a backup by substring of its name.
    ///
    /// `full` wins over `incr`/`delta`; names carrying neither are full.
    pub fn from_name(name: &str) -> Self {
        if name.contains("full") {
            BackupType::Full
        } else if name.contains("incr") || name.contains("delta") {
            BackupType::Incremental
        } else {
            BackupType::Full
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }
}

/// One entry of `wal-g backup-list --detail --json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupRecord {
    #[serde(deserialize_with = "de::nullable")]
    pub backup_name: String,
    #[serde(deserialize_with = "de::timestamp")]
    pub time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de::nullable")]
    pub wal_file_name: String,
    #[serde(deserialize_with = "de::lsn_text")]
    pub start_lsn: String,
    #[serde(deserialize_with = "de::lsn_text")]
    pub finish_lsn: String,
    #[serde(deserialize_with = "de::timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de::timestamp")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de::nullable")]
    pub datetime_format: String,
    #[serde(deserialize_with = "de::nullable")]
    pub hostname: String,
    #[serde(deserialize_with = "de::nullable")]
    pub data_size: i64,
    #[serde(deserialize_with = "de::nullable")]
    pub compressed_size: i64,
    #[serde(deserialize_with = "de::nullable")]
    pub uncompressed_size: i64,
    #[serde(deserialize_with = "de::nullable")]
    pub is_permanent: bool,
    #[serde(deserialize_with = "de::text_or_number")]
    pub system_identifier: String,
    /// Derived from `backup_name` after decoding; any sourced value is ignored.
    #[serde(skip_deserializing)]
    pub backup_type: BackupType,
}

impl BackupRecord {
    /// Backup duration in seconds, when both bounds are known.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_time, self.finish_time) {
            (Some(start), Some(finish)) => Some(seconds_between(start, finish)),
            _ => None,
        }
    }
}

/// One entry of `wal-g wal-show --json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSegmentRecord {
    #[serde(deserialize_with = "de::nullable")]
    pub wal_file_name: String,
    #[serde(deserialize_with = "de::lsn_text")]
    pub start_lsn: String,
    #[serde(deserialize_with = "de::lsn_text")]
    pub finish_lsn: String,
    #[serde(deserialize_with = "de::timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de::timestamp")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de::nullable")]
    pub data_size: i64,
    #[serde(deserialize_with = "de::nullable")]
    pub timeline: i64,
}

/// Signed difference `to - from` in fractional seconds.
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}
