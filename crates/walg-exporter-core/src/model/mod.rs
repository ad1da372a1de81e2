//! Data model shared by the collector, the metrics publisher and the HTTP API.

mod de;
pub mod inventory;
pub mod snapshot;

pub use inventory::{BackupRecord, BackupType, WalSegmentRecord};
pub use snapshot::{
    CollectTiming, LsnDelta, RecoveryWindow, ReplicationState, Snapshot, SourceKey,
};
