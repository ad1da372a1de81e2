//! In-memory [`ReplicationSource`] for tests.
//!
//! ```
//! use walg_exporter_core::collector::mock::MockSource;
//!
//! let source = MockSource::primary("0/3000000").with_diff("0/3000000", "0/2000000", 16_777_216);
//! assert_eq!(source.diff_calls(), 0);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use super::{CollectError, ReplicationSource};
use crate::model::ReplicationState;

/// Scripted replication source.
#[derive(Clone, Debug, Default)]
pub struct MockSource {
    state: Option<ReplicationState>,
    unavailable: Option<String>,
    diffs: HashMap<(String, String), i64>,
    delay: Duration,
    diff_calls: Arc<AtomicUsize>,
}

impl MockSource {
    /// A primary at `current_lsn`, timeline 1.
    pub fn primary(current_lsn: &str) -> Self {
        Self {
            state: Some(ReplicationState {
                current_lsn: current_lsn.to_string(),
                last_wal_received: current_lsn.to_string(),
                last_wal_replayed: current_lsn.to_string(),
                is_in_recovery: false,
                system_identifier: "7123456789012345678".to_string(),
                server_version: "PostgreSQL 16.2".to_string(),
                timeline: 1,
                captured_at: None,
            }),
            ..Self::default()
        }
    }

    /// A replica that received up to `received` and replayed up to `replayed`.
    pub fn replica(received: &str, replayed: &str) -> Self {
        let mut source = Self::primary(received);
        if let Some(state) = source.state.as_mut() {
            state.last_wal_replayed = replayed.to_string();
            state.is_in_recovery = true;
        }
        source
    }

    /// Every query fails with a connection error.
    pub fn unavailable(reason: &str) -> Self {
        Self {
            unavailable: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Stubs `pg_wal_lsn_diff(a, b)`; unstubbed pairs fail as query errors.
    pub fn with_diff(mut self, a: &str, b: &str, diff: i64) -> Self {
        self.diffs.insert((a.to_string(), b.to_string()), diff);
        self
    }

    /// Delays every call, to exercise deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of diff queries issued so far.
    pub fn diff_calls(&self) -> usize {
        self.diff_calls.load(Ordering::Relaxed)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl ReplicationSource for MockSource {
    async fn replication_state(&self, _deadline: Instant) -> Result<ReplicationState, CollectError> {
        self.pause().await;
        if let Some(reason) = &self.unavailable {
            return Err(CollectError::Connection(reason.clone()));
        }
        let mut state = self.state.clone().unwrap_or_default();
        state.captured_at = Some(Utc::now());
        Ok(state)
    }

    async fn lsn_diff(&self, a: &str, b: &str, _deadline: Instant) -> Result<i64, CollectError> {
        self.diff_calls.fetch_add(1, Ordering::Relaxed);
        self.pause().await;
        if let Some(reason) = &self.unavailable {
            return Err(CollectError::Connection(reason.clone()));
        }
        self.diffs
            .get(&(a.to_string(), b.to_string()))
            .copied()
            .ok_or_else(|| CollectError::Query(format!("no diff stubbed for {a} - {b}")))
    }
}
