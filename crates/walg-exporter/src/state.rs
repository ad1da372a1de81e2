//! Shared HTTP state.

use prometheus::Registry;

use walg_exporter_core::publish::SnapshotReader;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) registry: Registry,
    pub(crate) snapshots: SnapshotReader,
    pub(crate) metrics_path: String,
}
