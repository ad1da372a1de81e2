//! Point-in-time recovery window.

use crate::model::inventory::seconds_between;
use crate::model::{BackupRecord, RecoveryWindow, WalSegmentRecord};

/// Derives the recoverable range from backup and WAL timestamps.
///
/// The lower bound is the oldest backup start. The upper bound is the newest
/// WAL segment finish when any segments exist, since archived WAL extends
/// recovery past the last backup; otherwise the newest backup finish.
/// Unset timestamps are ignored.
pub fn recovery_window(backups: &[BackupRecord], wal_segments: &[WalSegmentRecord]) -> RecoveryWindow {
    let earliest = backups.iter().filter_map(|b| b.start_time).min();
    let latest = if wal_segments.is_empty() {
        backups.iter().filter_map(|b| b.finish_time).max()
    } else {
        wal_segments.iter().filter_map(|w| w.finish_time).max()
    };

    let window_hours = match (earliest, latest) {
        (Some(earliest), Some(latest)) => seconds_between(earliest, latest) / 3600.0,
        _ => 0.0,
    };

    RecoveryWindow {
        earliest,
        latest,
        window_hours,
    }
}
