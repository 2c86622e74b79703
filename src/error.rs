//! Error types for blobtail using snafu.
//!
//! Each concern gets its own enum with context selectors. `IngestError`
//! aggregates them for a single polling cycle and `AppError` is what the
//! binary reports.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur while talking to the blob container.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error while preparing local storage.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// Azure configuration error.
    #[snafu(display("Azure configuration error: {source}"))]
    AzureConfig { source: object_store::Error },

    /// Local filesystem configuration error.
    #[snafu(display("Local storage configuration error: {source}"))]
    LocalConfig { source: object_store::Error },

    /// A remote call did not finish within its deadline.
    #[snafu(display("{operation} timed out after {secs}s"))]
    Timeout { operation: &'static str, secs: u64 },

    /// A listing never returned an empty continuation token.
    #[snafu(display("Listing prefix '{prefix}' exceeded {pages} pages"))]
    PageLimitExceeded { prefix: String, pages: usize },

    /// An object name is not a valid store location.
    #[snafu(display("Invalid object name '{name}'"))]
    InvalidPath {
        name: String,
        source: object_store::path::Error,
    },

    /// Requested byte range is not valid for the object.
    #[snafu(display("Invalid range {start}..{end} for {name}"))]
    InvalidRange { name: String, start: u64, end: u64 },
}

// ============ Checkpoint Errors ============

/// Errors raised by the checkpoint table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Underlying table storage failed.
    #[snafu(display("Checkpoint table operation failed: {source}"))]
    TableStore { source: object_store::Error },

    /// Failed to serialize an entity.
    #[snafu(display("Failed to serialize checkpoint entity"))]
    EntitySerialize { source: serde_json::Error },

    /// A stored entity could not be parsed.
    #[snafu(display("Corrupt checkpoint entity at {key}"))]
    EntityParse {
        key: String,
        source: serde_json::Error,
    },

    /// Row key is not valid base64.
    #[snafu(display("Row key '{row_key}' is not valid base64"))]
    RowKeyDecode {
        row_key: String,
        source: base64::DecodeError,
    },

    /// Row key decodes to bytes that are not UTF-8.
    #[snafu(display("Row key '{row_key}' does not decode to UTF-8"))]
    RowKeyUtf8 {
        row_key: String,
        source: std::string::FromUtf8Error,
    },

    /// A continuation token does not name a stored entity.
    #[snafu(display("Invalid continuation token '{token}'"))]
    InvalidContinuation {
        token: String,
        source: object_store::path::Error,
    },

    /// Concurrent writers kept winning the merge race.
    #[snafu(display("Upsert of {row_key} lost {attempts} consecutive write races"))]
    UpsertConflict { row_key: String, attempts: usize },

    /// Checkpoint store could not be constructed.
    #[snafu(display("Failed to open checkpoint store"))]
    TableOpen { source: StorageError },
}

// ============ Codec Errors ============

/// Errors that can occur while turning bytes into events.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    /// A line was not valid JSON.
    #[snafu(display("Invalid JSON on line {line}"))]
    JsonLine {
        line: usize,
        source: serde_json::Error,
    },

    /// A line was not valid UTF-8.
    #[snafu(display("Invalid UTF-8 on line {line}"))]
    Utf8Line {
        line: usize,
        source: std::str::Utf8Error,
    },
}

// ============ Sink Errors ============

/// Errors raised when handing events downstream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// The receiving side has gone away.
    #[snafu(display("Event sink is closed"))]
    Closed,

    /// Writing an event failed.
    #[snafu(display("Failed to write event"))]
    Write { source: std::io::Error },

    /// Serializing an event failed.
    #[snafu(display("Failed to serialize event"))]
    Serialize { source: serde_json::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Storage account is empty.
    #[snafu(display("storage.account cannot be empty"))]
    EmptyAccount,

    /// Container is empty.
    #[snafu(display("storage.container cannot be empty"))]
    EmptyContainer,

    /// No prefixes configured.
    #[snafu(display("source.path_prefixes must contain at least one entry"))]
    EmptyPrefixes,

    /// Poll interval of zero would spin.
    #[snafu(display("source.poll_interval_secs must be greater than zero"))]
    ZeroPollInterval,

    /// Listing page size of zero.
    #[snafu(display("source.page_size must be greater than zero"))]
    ZeroPageSize,

    /// Page ceiling of zero would fail every listing.
    #[snafu(display("source.max_pages must be greater than zero"))]
    ZeroMaxPages,

    /// Listing page timeout of zero.
    #[snafu(display("source.list_timeout_secs must be greater than zero"))]
    ZeroListTimeout,

    /// Lease duration of zero.
    #[snafu(display("lease.duration_secs must be greater than zero"))]
    ZeroLeaseDuration,

    /// Lease acquisition timeout of zero.
    #[snafu(display("lease.acquire_timeout_secs must be greater than zero"))]
    ZeroAcquireTimeout,

    /// Table name does not follow table naming rules.
    #[snafu(display(
        "checkpoint.table '{name}' must be 3-63 alphanumeric characters starting with a letter"
    ))]
    InvalidTableName { name: String },

    /// File sink without a path.
    #[snafu(display("sink.path is required for file sinks"))]
    MissingSinkPath,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Ingest Errors ============

/// Everything that can end a polling cycle early.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    /// Cooperative cancellation. Never swallowed.
    #[snafu(display("Shutdown requested"))]
    ShutdownRequested,

    /// Enumerating the container failed.
    #[snafu(display("Failed to list container"))]
    Listing { source: StorageError },

    /// Fetching blob content failed.
    #[snafu(display("Failed to fetch {name}"))]
    Fetch { name: String, source: StorageError },

    /// Reading or writing checkpoints failed.
    #[snafu(display("Checkpoint store error"))]
    Checkpoint { source: CheckpointError },

    /// Content of a blob could not be decoded.
    #[snafu(display("Failed to decode {name}"))]
    Decode { name: String, source: CodecError },

    /// Downstream refused an event.
    #[snafu(display("Failed to emit event from {name}"))]
    Emit { name: String, source: SinkError },
}

impl IngestError {
    /// True when this error is the cooperative shutdown signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, IngestError::ShutdownRequested)
    }
}

// ============ App Error (top-level) ============

/// Top-level errors reported by the binary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Storage client construction error.
    #[snafu(display("Storage error"))]
    AppStorage { source: StorageError },

    /// Checkpoint store initialization error.
    #[snafu(display("Checkpoint error"))]
    AppCheckpoint { source: CheckpointError },

    /// Sink construction error.
    #[snafu(display("Sink error"))]
    AppSink { source: SinkError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}
