//! Snapshot aggregate produced once per collection cycle.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::inventory::{BackupRecord, WalSegmentRecord};

/// Replication/recovery state reported by the live server.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReplicationState {
    /// Current write position, or the last received position on a replica.
    pub current_lsn: String,
    pub last_wal_received: String,
    pub last_wal_replayed: String,
    pub is_in_recovery: bool,
    pub system_identifier: String,
    pub server_version: String,
    pub timeline: i32,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Byte distance between the current LSN and the latest backup / WAL segment.
///
/// Zero means either "no distance" or "not computed"; the snapshot's error
/// map tells the two apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LsnDelta {
    pub backup_delta: i64,
    pub wal_delta: i64,
}

/// Point-in-time recovery window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RecoveryWindow {
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub window_hours: f64,
}

/// Data sources and derived steps of a collection cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKey {
    PostgresInfo,
    BackupList,
    WalInfo,
    LsnDelta,
    PitrWindow,
}

impl SourceKey {
    /// All keys in collection order.
    pub const ALL: [SourceKey; 5] = [
        SourceKey::PostgresInfo,
        SourceKey::BackupList,
        SourceKey::WalInfo,
        SourceKey::LsnDelta,
        SourceKey::PitrWindow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKey::PostgresInfo => "postgres_info",
            SourceKey::BackupList => "backup_list",
            SourceKey::WalInfo => "wal_info",
            SourceKey::LsnDelta => "lsn_delta",
            SourceKey::PitrWindow => "pitr_window",
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time spent in each collection step.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CollectTiming {
    pub total: Duration,
    pub postgres_info: Duration,
    pub backup_list: Duration,
    pub wal_info: Duration,
    pub lsn_delta: Duration,
    pub pitr_window: Duration,
}

impl CollectTiming {
    pub(crate) fn record(&mut self, key: SourceKey, elapsed: Duration) {
        let slot = match key {
            SourceKey::PostgresInfo => &mut self.postgres_info,
            SourceKey::BackupList => &mut self.backup_list,
            SourceKey::WalInfo => &mut self.wal_info,
            SourceKey::LsnDelta => &mut self.lsn_delta,
            SourceKey::PitrWindow => &mut self.pitr_window,
        };
        *slot = elapsed;
    }
}

/// Best-effort view of replication state and backup inventory.
///
/// Built fresh every cycle and never mutated once published. Backups and WAL
/// segments keep the order the inventory tool emitted them in.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub backups: Vec<BackupRecord>,
    pub wal_segments: Vec<WalSegmentRecord>,
    pub replication: ReplicationState,
    pub lsn_delta: LsnDelta,
    pub recovery_window: RecoveryWindow,
    pub captured_at: Option<DateTime<Utc>>,
    /// Failure description per source; absent key means the step succeeded.
    pub errors: BTreeMap<SourceKey, String>,
    pub timing: CollectTiming,
}

impl Snapshot {
    pub(crate) fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at: Some(captured_at),
            ..Self::default()
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&self, key: SourceKey) -> Option<&str> {
        self.errors.get(&key).map(String::as_str)
    }
}
