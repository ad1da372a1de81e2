//! Exporter configuration: TOML file with defaults, overridden by CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::ValueEnum;
use serde::Deserialize;
use tracing::info;

use crate::Args;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ExporterConfig {
    pub(crate) listen_address: String,
    pub(crate) metrics_path: String,
    pub(crate) walg_binary: PathBuf,
    /// Arguments placed before the wal-g subcommand, for wrappers such as `envdir`.
    pub(crate) walg_args: Vec<String>,
    pub(crate) postgres_connection: String,
    /// Seconds between collection cycles.
    pub(crate) scrape_interval: u64,
    /// Seconds one collection cycle may take.
    pub(crate) collect_timeout: u64,
    pub(crate) log_level: String,
    pub(crate) log_format: LogFormat,
}

/// Routes served alongside the metrics path.
const RESERVED_PATHS: &[&str] = &["/", "/health", "/ready", "/api/v1/snapshot"];

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9351".to_string(),
            metrics_path: "/metrics".to_string(),
            walg_binary: PathBuf::from("wal-g"),
            walg_args: Vec::new(),
            postgres_connection: String::new(),
            scrape_interval: 60,
            collect_timeout: 30,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl ExporterConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Loads the file named by `--config` (if any) and applies the flags on top.
    pub(crate) fn resolve(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, args: &Args) {
        if let Some(v) = &args.listen_address {
            self.listen_address = v.clone();
        }
        if let Some(v) = &args.metrics_path {
            self.metrics_path = v.clone();
        }
        if let Some(v) = &args.walg_binary {
            self.walg_binary = v.clone();
        }
        if let Some(v) = &args.postgres_connection {
            self.postgres_connection = v.clone();
        }
        if let Some(v) = args.scrape_interval {
            self.scrape_interval = v;
        }
        if let Some(v) = args.collect_timeout {
            self.collect_timeout = v;
        }
        if let Some(v) = &args.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = args.log_format {
            self.log_format = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.postgres_connection.trim().is_empty() {
            bail!("PostgreSQL connection string is required (--postgres-connection)");
        }
        if !self.metrics_path.starts_with('/') {
            bail!("metrics path must start with '/': {:?}", self.metrics_path);
        }
        if RESERVED_PATHS.contains(&self.metrics_path.as_str()) {
            bail!("metrics path {:?} collides with a built-in route", self.metrics_path);
        }
        if self.metrics_path.contains(['{', '}', '*']) {
            bail!(
                "metrics path must be a literal path without '{{', '}}' or '*': {:?}",
                self.metrics_path
            );
        }
        if self.scrape_interval == 0 {
            bail!("scrape interval must be positive");
        }
        if self.collect_timeout == 0 {
            bail!("collect timeout must be positive");
        }
        Ok(())
    }

    /// Listen address with an empty host (`:9351`) bound to all interfaces.
    pub(crate) fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    pub(crate) fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval)
    }

    pub(crate) fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout)
    }

    pub(crate) fn log_summary(&self) {
        info!(
            listen_address = %self.listen_address,
            metrics_path = %self.metrics_path,
            walg_binary = %self.walg_binary.display(),
            scrape_interval_secs = self.scrape_interval,
            collect_timeout_secs = self.collect_timeout,
            "configuration loaded"
        );
    }
}
