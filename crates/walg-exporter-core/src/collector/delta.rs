//! LSN distance from the current position to the latest backup and WAL segment.
//!
//! "Latest" is the last element of each list as the inventory tool returned
//! it; the lists are not re-sorted here.

use tokio::time::Instant;
use tracing::warn;

use super::{CollectError, ReplicationSource};
use crate::lsn;
use crate::model::{BackupRecord, LsnDelta, WalSegmentRecord};

/// Computes both deltas, delegating the arithmetic to the server.
///
/// A delta whose target is missing (no records, or an absent finish LSN) is
/// left at zero without error, as is one whose LSN fails validation. A failed
/// diff query does not stop the other delta; the delta computed so far is
/// returned together with the first failure.
pub async fn compute_lsn_delta<S>(
    source: &S,
    current_lsn: &str,
    backups: &[BackupRecord],
    wal_segments: &[WalSegmentRecord],
    deadline: Instant,
) -> (LsnDelta, Option<CollectError>)
where
    S: ReplicationSource + ?Sized,
{
    let mut delta = LsnDelta::default();
    if current_lsn.is_empty() {
        return (delta, Some(CollectError::NoCurrentLsn));
    }
    if !lsn::validate(current_lsn) {
        warn!(lsn = current_lsn, "current LSN is malformed, skipping deltas");
        return (delta, None);
    }

    let mut failure = None;

    let last_backup = backups.last().map(|b| b.finish_lsn.as_str());
    match diff_to(source, current_lsn, last_backup, "backup", deadline).await {
        Ok(Some(diff)) => delta.backup_delta = diff,
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "failed to calculate backup LSN delta");
            failure = Some(e);
        }
    }

    let last_wal = wal_segments.last().map(|w| w.finish_lsn.as_str());
    match diff_to(source, current_lsn, last_wal, "wal", deadline).await {
        Ok(Some(diff)) => delta.wal_delta = diff,
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "failed to calculate WAL LSN delta");
            failure.get_or_insert(e);
        }
    }

    (delta, failure)
}

async fn diff_to<S>(
    source: &S,
    current_lsn: &str,
    target: Option<&str>,
    kind: &'static str,
    deadline: Instant,
) -> Result<Option<i64>, CollectError>
where
    S: ReplicationSource + ?Sized,
{
    let Some(target) = target.filter(|t| !lsn::is_absent(t)) else {
        return Ok(None);
    };
    if !lsn::validate(target) {
        warn!(kind, lsn = target, "finish LSN is malformed, skipping delta");
        return Ok(None);
    }
    source.lsn_diff(current_lsn, target, deadline).await.map(Some)
}
