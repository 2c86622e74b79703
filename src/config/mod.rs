//! Configuration loading and validation.
//!
//! Configuration is read from a YAML file, environment variables are
//! expanded first, and every rule is checked before anything connects to
//! remote services.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyAccountSnafu, EmptyContainerSnafu, EmptyPrefixesSnafu,
    EnvInterpolationSnafu, InvalidTableNameSnafu, MissingSinkPathSnafu, ReadFileSnafu,
    YamlParseSnafu, ZeroAcquireTimeoutSnafu, ZeroLeaseDurationSnafu, ZeroListTimeoutSnafu,
    ZeroMaxPagesSnafu, ZeroPageSizeSnafu, ZeroPollIntervalSnafu,
};

/// Default storage endpoint suffix.
pub const DEFAULT_ENDPOINT: &str = "core.windows.net";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub source: SourceConfig,
    /// When present, progress is tracked in a checkpoint table and leases are not used.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where the blobs live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage account name.
    pub account: String,
    /// Account access key. Falls back to `AZURE_STORAGE_*` environment variables.
    #[serde(default)]
    pub access_key: Option<String>,
    /// Container to watch.
    pub container: String,
    /// Service endpoint suffix (default: "core.windows.net").
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Override backend URL (`file:///path`, `/path` or `memory://`).
    #[serde(default)]
    pub url: Option<String>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

/// Where a blob is first read from when no checkpoint exists for it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    Beginning,
    #[default]
    End,
}

/// Event codec applied to fetched bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    JsonLines,
    Line,
}

/// Listing and polling behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Name prefixes to scan, in order. `[""]` scans the whole container.
    #[serde(default = "default_path_prefixes")]
    pub path_prefixes: Vec<String>,

    /// Seconds between polls (default: 10).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Blobs last modified longer ago than this are ignored (default: 24h).
    #[serde(default = "default_ignore_older_secs")]
    pub ignore_older_secs: u64,

    #[serde(default)]
    pub start_position: StartPosition,

    #[serde(default)]
    pub codec: CodecKind,

    /// Static fields added to every event.
    #[serde(default)]
    pub add_fields: HashMap<String, String>,

    /// Entries requested per listing page (default: 5000).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Upper bound on pages fetched per prefix in one listing (default: 10000).
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Per-page listing timeout in seconds (default: 10).
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path_prefixes: default_path_prefixes(),
            poll_interval_secs: default_poll_interval_secs(),
            ignore_older_secs: default_ignore_older_secs(),
            start_position: StartPosition::default(),
            codec: CodecKind::default(),
            add_fields: HashMap::new(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            list_timeout_secs: default_list_timeout_secs(),
        }
    }
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.ignore_older_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }
}

fn default_path_prefixes() -> Vec<String> {
    vec![String::new()]
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_ignore_older_secs() -> u64 {
    24 * 60 * 60
}

fn default_page_size() -> usize {
    5000
}

fn default_max_pages() -> usize {
    10_000
}

fn default_list_timeout_secs() -> u64 {
    10
}

/// Checkpoint table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Table name.
    pub table: String,
    /// Storage URL that holds the table. Defaults to the account's blob
    /// service with a container named after the table.
    #[serde(default)]
    pub location: Option<String>,
}

/// Lease settings used when no checkpoint table is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_lease_duration_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_lease_duration_secs() -> u64 {
    60
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

/// Downstream destination for events.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default, rename = "type")]
    pub kind: SinkKind,
    /// Output path for `file` sinks.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Table names: 3-63 alphanumerics, first character a letter.
fn is_valid_table_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = vars::expand(content).map_err(|problems| {
            EnvInterpolationSnafu {
                message: problems.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.storage.account.is_empty(), EmptyAccountSnafu);
        ensure!(!self.storage.container.is_empty(), EmptyContainerSnafu);
        ensure!(!self.source.path_prefixes.is_empty(), EmptyPrefixesSnafu);
        ensure!(self.source.poll_interval_secs > 0, ZeroPollIntervalSnafu);
        ensure!(self.source.page_size > 0, ZeroPageSizeSnafu);
        ensure!(self.source.max_pages > 0, ZeroMaxPagesSnafu);
        ensure!(self.source.list_timeout_secs > 0, ZeroListTimeoutSnafu);
        ensure!(self.lease.duration_secs > 0, ZeroLeaseDurationSnafu);
        ensure!(self.lease.acquire_timeout_secs > 0, ZeroAcquireTimeoutSnafu);
        if let Some(checkpoint) = &self.checkpoint {
            ensure!(
                is_valid_table_name(&checkpoint.table),
                InvalidTableNameSnafu {
                    name: checkpoint.table.clone()
                }
            );
        }
        if self.sink.kind == SinkKind::File {
            ensure!(self.sink.path.is_some(), MissingSinkPathSnafu);
        }
        Ok(())
    }
}
