//! Snapshot collection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Collector                           │
//! │  ┌──────────────────────┐   ┌─────────────────────────────┐  │
//! │  │  ReplicationSource   │   │      InventoryFetcher       │  │
//! │  │  - replication query │   │  - wal-g backup-list        │  │
//! │  │  - pg_wal_lsn_diff   │   │  - wal-g wal-show           │  │
//! │  └──────────┬───────────┘   └──────────────┬──────────────┘  │
//! │             └──────────────┬───────────────┘                 │
//! │                    ┌───────▼────────┐                        │
//! │                    │ delta / window │                        │
//! │                    └───────┬────────┘                        │
//! └────────────────────────────┼─────────────────────────────────┘
//!                              ▼
//!                          Snapshot
//! ```
//!
//! Every step runs under one per-cycle deadline. A failing step records its
//! error against its [`SourceKey`](crate::model::SourceKey) and the cycle
//! moves on; [`Collector::collect`] always returns a snapshot.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use walg_exporter_core::collector::{Collector, InventoryFetcher, PostgresSource};
//! use walg_exporter_core::metrics::Metrics;
//!
//! let registry = prometheus::Registry::new();
//! let metrics = Arc::new(Metrics::new(&registry)?);
//! let source = PostgresSource::new("host=localhost user=postgres");
//! let collector = Collector::new(source, InventoryFetcher::new("wal-g"), metrics);
//! let snapshot = collector.collect_with_timeout(Duration::from_secs(30)).await;
//! ```

#[allow(clippy::module_inception)]
mod collector;
mod delta;
pub mod inventory;
pub mod mock;
mod postgres;
mod queries;
mod window;

use std::future::Future;

use thiserror::Error;
use tokio::time::Instant;

pub use collector::Collector;
pub use delta::compute_lsn_delta;
pub use inventory::{Decoded, InventoryFetcher, InventoryRecord, OutputShape, decode_inventory};
pub use postgres::{PostgresSource, ReplicationSource};
pub use window::recovery_window;

/// Failure of a single collection step.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to connect to PostgreSQL: {0}")]
    Connection(String),
    #[error("failed to query PostgreSQL: {0}")]
    Query(String),
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to parse {command} output: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no current LSN available")]
    NoCurrentLsn,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Runs `fut` until `deadline`, mapping expiry to [`CollectError::DeadlineExceeded`].
///
/// Dropping the inner future on expiry is what cancels it.
pub(crate) async fn bounded<T, F>(deadline: Instant, fut: F) -> Result<T, CollectError>
where
    F: Future<Output = Result<T, CollectError>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| CollectError::DeadlineExceeded)?
}
