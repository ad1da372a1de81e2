//! walg-exporter-core: WAL-G backup and replication monitoring library.
//!
//! Provides:
//! - `lsn`: PostgreSQL LSN text codec
//! - `model`: inventory records, replication state, the per-cycle snapshot
//! - `collector`: replication reader, wal-g inventory fetcher, delta and
//!   window derivation, snapshot aggregation
//! - `metrics`: Prometheus instruments derived from a snapshot
//! - `publish`: single-slot snapshot handoff to readers

pub mod collector;
pub mod lsn;
pub mod metrics;
pub mod model;
pub mod publish;

/// Crate version reported through `walg_exporter_info`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
