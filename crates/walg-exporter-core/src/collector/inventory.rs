//! Backup and WAL inventory from the wal-g command line.
//!
//! The tool prints either one JSON array or one JSON object per line,
//! depending on version and flags. [`decode_inventory`] tries the two
//! [`OutputShape`]s in a fixed order so callers never need to know which one
//! they got.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::CollectError;
use crate::lsn;
use crate::model::{BackupRecord, BackupType, SourceKey, WalSegmentRecord};

/// A record kind the fetcher knows how to request and post-process.
pub trait InventoryRecord: DeserializeOwned + Send + 'static {
    /// Subcommand and flags passed to the tool.
    const ARGS: &'static [&'static str];
    /// Key failures are recorded under.
    const SOURCE: SourceKey;

    /// Derives fields and normalizes sentinels after decoding.
    fn enrich(&mut self);
}

impl InventoryRecord for BackupRecord {
    const ARGS: &'static [&'static str] = &["backup-list", "--detail", "--json"];
    const SOURCE: SourceKey = SourceKey::BackupList;

    fn enrich(&mut self) {
        self.backup_type = BackupType::from_name(&self.backup_name);
        lsn::normalize(&mut self.start_lsn);
        lsn::normalize(&mut self.finish_lsn);
    }
}

impl InventoryRecord for WalSegmentRecord {
    const ARGS: &'static [&'static str] = &["wal-show", "--json"];
    const SOURCE: SourceKey = SourceKey::WalInfo;

    fn enrich(&mut self) {
        lsn::normalize(&mut self.start_lsn);
        lsn::normalize(&mut self.finish_lsn);
    }
}

/// Accepted shapes of the tool's standard output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputShape {
    /// A single JSON array of records.
    Batch,
    /// One JSON object per line; undecodable lines are dropped.
    LineDelimited,
}

/// Records decoded from one invocation.
#[derive(Debug)]
pub struct Decoded<R> {
    pub shape: OutputShape,
    pub records: Vec<R>,
    /// Lines that looked like records but did not decode.
    pub discarded: usize,
    /// Lines that looked like records (`{` or `[` prefix).
    pub candidates: usize,
}

impl OutputShape {
    fn decode<R: DeserializeOwned>(self, output: &[u8]) -> Result<Decoded<R>, serde_json::Error> {
        match self {
            OutputShape::Batch => {
                let records: Vec<R> = serde_json::from_slice(output)?;
                Ok(Decoded {
                    shape: self,
                    candidates: records.len(),
                    records,
                    discarded: 0,
                })
            }
            OutputShape::LineDelimited => Ok(decode_lines(output)),
        }
    }
}

fn decode_lines<R: DeserializeOwned>(output: &[u8]) -> Decoded<R> {
    let text = String::from_utf8_lossy(output);
    let mut decoded = Decoded {
        shape: OutputShape::LineDelimited,
        records: Vec::new(),
        discarded: 0,
        candidates: 0,
    };
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.starts_with('[') {
            decoded.candidates += 1;
            continue;
        }
        if !line.starts_with('{') {
            continue;
        }
        decoded.candidates += 1;
        match serde_json::from_str::<R>(line) {
            Ok(record) => decoded.records.push(record),
            Err(e) => {
                decoded.discarded += 1;
                debug!(line = lineno + 1, error = %e, "skipping malformed inventory line");
            }
        }
    }
    decoded
}

/// Decodes tool output, batch first, then line by line.
///
/// Fails only when nothing decoded although the output contained record-like
/// lines; blank or purely textual output is an empty inventory.
pub fn decode_inventory<R: DeserializeOwned>(
    output: &[u8],
) -> Result<Decoded<R>, serde_json::Error> {
    let batch_err = match OutputShape::Batch.decode(output) {
        Ok(decoded) => return Ok(decoded),
        Err(e) => e,
    };
    let decoded = OutputShape::LineDelimited.decode::<R>(output)?;
    if decoded.records.is_empty() && decoded.candidates > 0 {
        return Err(batch_err);
    }
    Ok(decoded)
}

/// Runs the inventory tool and decodes its output.
#[derive(Clone, Debug)]
pub struct InventoryFetcher {
    binary: PathBuf,
    prefix_args: Vec<String>,
}

impl InventoryFetcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Arguments placed before the subcommand.
    ///
    /// Covers wrappers such as `envdir /etc/wal-g.d/env wal-g`, where the
    /// binary is `envdir` and the rest are prefix arguments.
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Fetches and decodes one inventory kind.
    ///
    /// The child is killed if `deadline` passes or the returned future is
    /// dropped before it exits.
    pub async fn fetch<R: InventoryRecord>(&self, deadline: Instant) -> Result<Vec<R>, CollectError> {
        let command = self.command_line(R::ARGS);
        let stdout = self.run(R::ARGS, &command, deadline).await?;

        let decoded = decode_inventory::<R>(&stdout).map_err(|source| CollectError::Parse {
            command: command.clone(),
            source,
        })?;
        if decoded.discarded > 0 {
            warn!(
                command = %command,
                discarded = decoded.discarded,
                kept = decoded.records.len(),
                "dropped malformed inventory records"
            );
        }
        debug!(
            command = %command,
            shape = ?decoded.shape,
            records = decoded.records.len(),
            "inventory decoded"
        );

        let mut records = decoded.records;
        for record in &mut records {
            record.enrich();
        }
        Ok(records)
    }

    async fn run(
        &self,
        args: &[&str],
        command: &str,
        deadline: Instant,
    ) -> Result<Vec<u8>, CollectError> {
        debug!(command, "executing inventory command");
        let child = Command::new(&self.binary)
            .args(&self.prefix_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollectError::Spawn {
                command: command.to_string(),
                source,
            })?;

        // On expiry the wait future is dropped together with the child,
        // and kill_on_drop sends SIGKILL.
        let output = match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CollectError::Spawn {
                command: command.to_string(),
                source,
            })?,
            Err(_) => {
                warn!(command, "inventory command timed out, killed");
                return Err(CollectError::DeadlineExceeded);
            }
        };

        if !output.status.success() {
            return Err(CollectError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        parts.extend(self.prefix_args.iter().cloned());
        parts.extend(args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// Fetcher running `script` through `sh -c`; `$1` is the subcommand.
    pub(crate) fn scripted(script: &str) -> InventoryFetcher {
        InventoryFetcher::new("sh").with_prefix_args(["-c", script, "wal-g"])
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    const BACKUPS_ARRAY: &str = r#"[
        {"backup_name":"backup_full_1","start_lsn":"0/2000028","finish_lsn":"0/2000100","start_time":"2024-03-01T00:00:00Z","finish_time":"2024-03-01T00:30:00Z"},
        {"backup_name":"backup_delta_2","start_lsn":"","finish_lsn":"0/5000100","start_time":"2024-03-01T06:00:00Z","finish_time":"2024-03-01T06:10:00Z"}
    ]"#;

    #[test]
    fn batch_output_decodes_as_batch() {
        let decoded = decode_inventory::<BackupRecord>(BACKUPS_ARRAY.as_bytes()).unwrap();
        assert_eq!(decoded.shape, OutputShape::Batch);
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[1].backup_name, "backup_delta_2");
    }

    #[test]
    fn line_delimited_matches_batch() {
        let batch = decode_inventory::<BackupRecord>(BACKUPS_ARRAY.as_bytes()).unwrap();
        let lines: Vec<String> = serde_json::from_str::<Vec<serde_json::Value>>(BACKUPS_ARRAY)
            .unwrap()
            .iter()
            .map(|v| v.to_string())
            .collect();
        let ndjson = lines.join("\n");

        let decoded = decode_inventory::<BackupRecord>(ndjson.as_bytes()).unwrap();
        assert_eq!(decoded.shape, OutputShape::LineDelimited);
        assert_eq!(decoded.records, batch.records);
    }

    #[test]
    fn corrupt_line_is_skipped() {
        let output = "\
{\"wal_file_name\":\"000000010000000000000001\",\"timeline\":1}
{\"wal_file_name\": broken
INFO: 2024/03/01 12:00:00.000000 some log line

   {\"wal_file_name\":\"000000010000000000000002\",\"timeline\":1}
";
        let decoded = decode_inventory::<WalSegmentRecord>(output.as_bytes()).unwrap();
        assert_eq!(decoded.shape, OutputShape::LineDelimited);
        assert_eq!(decoded.discarded, 1);
        let names: Vec<&str> = decoded
            .records
            .iter()
            .map(|r| r.wal_file_name.as_str())
            .collect();
        assert_eq!(names, ["000000010000000000000001", "000000010000000000000002"]);
    }

    #[test]
    fn blank_and_banner_output_is_empty_inventory() {
        for output in ["", "  \n\n", "No backups found\n", "null"] {
            let decoded = decode_inventory::<BackupRecord>(output.as_bytes()).unwrap();
            assert!(decoded.records.is_empty(), "output: {output:?}");
        }
        let decoded = decode_inventory::<BackupRecord>(b"[]").unwrap();
        assert_eq!(decoded.shape, OutputShape::Batch);
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn nothing_usable_is_a_parse_error() {
        for output in ["{broken\n{also broken}\n", "[{\"backup_name\": 1}]"] {
            assert!(
                decode_inventory::<BackupRecord>(output.as_bytes()).is_err(),
                "output: {output:?}"
            );
        }
    }

    #[tokio::test]
    async fn fetch_backups_enriches_records() {
        let fetcher = scripted(&format!(
            "test \"$1 $2 $3\" = 'backup-list --detail --json' || exit 2\ncat <<'EOF'\n{BACKUPS_ARRAY}\nEOF"
        ));
        let backups = fetcher.fetch::<BackupRecord>(in_secs(10)).await.unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].backup_type, BackupType::Full);
        assert_eq!(backups[1].backup_type, BackupType::Incremental);
        assert_eq!(backups[1].start_lsn, lsn::ZERO);
        assert_eq!(backups[1].finish_lsn, "0/5000100");
    }

    #[tokio::test]
    async fn fetch_wal_normalizes_lsns() {
        let fetcher = scripted(
            "test \"$1 $2\" = 'wal-show --json' || exit 2\n\
             echo '{\"wal_file_name\":\"000000010000000000000003\",\"start_lsn\":\"0/3000000\"}'",
        );
        let segments = fetcher.fetch::<WalSegmentRecord>(in_secs(10)).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_lsn, "0/3000000");
        assert_eq!(segments[0].finish_lsn, lsn::ZERO);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_status_and_stderr() {
        let fetcher = scripted("echo 'storage unreachable' >&2; exit 3");
        let err = fetcher.fetch::<BackupRecord>(in_secs(10)).await.unwrap_err();
        match err {
            CollectError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert!(command.ends_with("backup-list --detail --json"));
                assert!(status.contains('3'), "status: {status}");
                assert_eq!(stderr, "storage unreachable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let fetcher = InventoryFetcher::new("/nonexistent/wal-g");
        let err = fetcher.fetch::<WalSegmentRecord>(in_secs(10)).await.unwrap_err();
        assert!(matches!(err, CollectError::Spawn { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn unparsable_output_is_a_parse_error() {
        let fetcher = scripted("echo '{not json'");
        let err = fetcher.fetch::<WalSegmentRecord>(in_secs(10)).await.unwrap_err();
        assert!(matches!(err, CollectError::Parse { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let fetcher = scripted(&format!("echo $$ > {}; exec sleep 30", pid_file.display()));

        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_millis(500);
        let err = fetcher.fetch::<BackupRecord>(deadline).await.unwrap_err();
        assert!(matches!(err, CollectError::DeadlineExceeded), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat_path = format!("/proc/{}/stat", pid.trim());
        let mut gone = false;
        for _ in 0..50 {
            // Killed children may linger as zombies until reaped.
            match std::fs::read_to_string(&stat_path) {
                Err(_) => gone = true,
                Ok(stat) => gone = stat.contains(") Z "),
            }
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "child process still running");
    }
}
