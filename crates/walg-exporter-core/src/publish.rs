//! Single-slot handoff of the latest [`Snapshot`] from the collection loop to readers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::model::Snapshot;

/// Creates a connected publisher/reader pair with no snapshot published yet.
pub fn channel() -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(None);
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

/// Write side, owned by the collection loop.
pub struct SnapshotPublisher {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl SnapshotPublisher {
    /// Replaces the current snapshot. Succeeds even when no reader is left.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(Some(Arc::clone(&snapshot)));
        snapshot
    }

    pub fn subscribe(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side; cheap to clone, one per consumer.
#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Option<Arc<Snapshot>>>,
}

impl SnapshotReader {
    /// The most recently published snapshot, or `None` before the first cycle.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.rx.borrow().clone()
    }

    /// Waits for a snapshot newer than the last one seen by this reader.
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}
