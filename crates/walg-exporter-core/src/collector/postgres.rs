//! Replication state reader.
//!
//! Reads the server's own view of its WAL position and recovery status and
//! delegates LSN distance arithmetic to `pg_wal_lsn_diff`. One connection is
//! kept across cycles and re-established lazily after it drops; there are no
//! retries within a cycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use super::{CollectError, bounded, queries};
use crate::model::ReplicationState;

/// Server-side view of replication state and LSN distance.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Reads current/received/replayed LSNs, recovery flag and identity.
    async fn replication_state(&self, deadline: Instant) -> Result<ReplicationState, CollectError>;

    /// Signed byte distance `a - b` between two textual LSNs.
    async fn lsn_diff(&self, a: &str, b: &str, deadline: Instant) -> Result<i64, CollectError>;
}

/// [`ReplicationSource`] backed by a live PostgreSQL connection.
pub struct PostgresSource {
    connection_string: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresSource {
    /// Creates a source for a libpq-style or URL connection string.
    ///
    /// No connection is made until the first query.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: Mutex::new(None),
        }
    }

    /// Connects eagerly, for startup checks.
    pub async fn try_connect(&self, deadline: Instant) -> Result<(), CollectError> {
        self.ensure_connected(deadline).await.map(|_| ())
    }

    /// Returns the open client, reconnecting if the previous one closed.
    async fn ensure_connected(&self, deadline: Instant) -> Result<Arc<Client>, CollectError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref()
            && !client.is_closed()
        {
            return Ok(client.clone());
        }
        if slot.take().is_some() {
            debug!("postgres connection closed, reconnecting");
        }

        let (client, connection) = bounded(deadline, async {
            tokio_postgres::connect(&self.connection_string, NoTls)
                .await
                .map_err(|e| CollectError::Connection(format_postgres_error(&e)))
        })
        .await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %format_postgres_error(&e), "postgres connection terminated");
            }
        });
        info!("connected to PostgreSQL");

        let client = Arc::new(client);
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        deadline: Instant,
    ) -> Result<Row, CollectError> {
        let client = self.ensure_connected(deadline).await?;
        match tokio::time::timeout_at(deadline, client.query_one(sql, params)).await {
            Ok(Ok(row)) => Ok(row),
            Ok(Err(e)) => Err(CollectError::Query(format_postgres_error(&e))),
            Err(_) => {
                // Dropping the future only stops waiting; the backend keeps
                // running the statement until told otherwise.
                let token = client.cancel_token();
                tokio::spawn(async move {
                    if let Err(e) = token.cancel_query(NoTls).await {
                        debug!(error = %e, "failed to cancel timed out query");
                    }
                });
                Err(CollectError::DeadlineExceeded)
            }
        }
    }
}

#[async_trait]
impl ReplicationSource for PostgresSource {
    async fn replication_state(&self, deadline: Instant) -> Result<ReplicationState, CollectError> {
        let row = self
            .query_one(queries::REPLICATION_STATE, &[], deadline)
            .await?;
        let state = replication_state_from_row(&row)?;
        debug!(
            current_lsn = %state.current_lsn,
            is_in_recovery = state.is_in_recovery,
            timeline = state.timeline,
            "replication state collected"
        );
        Ok(state)
    }

    async fn lsn_diff(&self, a: &str, b: &str, deadline: Instant) -> Result<i64, CollectError> {
        let row = self.query_one(queries::LSN_DIFF, &[&a, &b], deadline).await?;
        let diff: Option<i64> = row.try_get(0).map_err(query_error)?;
        Ok(diff.unwrap_or_default())
    }
}

fn replication_state_from_row(row: &Row) -> Result<ReplicationState, CollectError> {
    let text = |idx: usize| -> Result<String, CollectError> {
        Ok(row
            .try_get::<_, Option<String>>(idx)
            .map_err(query_error)?
            .unwrap_or_default())
    };
    Ok(ReplicationState {
        current_lsn: text(0)?,
        last_wal_received: text(1)?,
        last_wal_replayed: text(2)?,
        is_in_recovery: row
            .try_get::<_, Option<bool>>(3)
            .map_err(query_error)?
            .unwrap_or_default(),
        system_identifier: text(4)?,
        server_version: text(5)?,
        timeline: row
            .try_get::<_, Option<i32>>(6)
            .map_err(query_error)?
            .unwrap_or_default(),
        captured_at: Some(Utc::now()),
    })
}

fn query_error(e: tokio_postgres::Error) -> CollectError {
    CollectError::Query(format_postgres_error(&e))
}

/// Formats PostgreSQL error message for display.
fn format_postgres_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        // Port 1 on loopback refuses immediately on any sane host.
        let source = PostgresSource::new("host=127.0.0.1 port=1 user=nobody connect_timeout=1");
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = source.replication_state(deadline).await.unwrap_err();
        assert!(
            matches!(
                err,
                CollectError::Connection(_) | CollectError::DeadlineExceeded
            ),
            "unexpected error: {err}"
        );
    }
}
