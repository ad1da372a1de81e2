//! SQL used by the replication state reader.

/// Replication/recovery state in one row.
///
/// On a replica `pg_current_wal_lsn()` raises an error, so the current
/// position falls back to the last received LSN. `CASE` only evaluates the
/// taken branch.
pub(super) const REPLICATION_STATE: &str = r#"
    SELECT
        COALESCE((CASE WHEN pg_is_in_recovery()
            THEN pg_last_wal_receive_lsn()
            ELSE pg_current_wal_lsn()
        END)::text, '') AS current_lsn,
        COALESCE((CASE WHEN pg_is_in_recovery()
            THEN pg_last_wal_receive_lsn()
            ELSE pg_current_wal_lsn()
        END)::text, '') AS last_wal_received,
        COALESCE((CASE WHEN pg_is_in_recovery()
            THEN pg_last_wal_replay_lsn()
            ELSE pg_current_wal_lsn()
        END)::text, '') AS last_wal_replayed,
        COALESCE(pg_is_in_recovery(), false) AS is_in_recovery,
        COALESCE(s.system_identifier::text, '') AS system_identifier,
        COALESCE(version(), '') AS server_version,
        COALESCE(c.timeline_id, 0) AS timeline
    FROM pg_control_system() s, pg_control_checkpoint() c
"#;

/// Signed byte distance `$1 - $2` as computed by the server.
pub(super) const LSN_DIFF: &str =
    "SELECT pg_wal_lsn_diff($1::text::pg_lsn, $2::text::pg_lsn)::bigint AS lsn_diff";
