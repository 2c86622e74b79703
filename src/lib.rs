//! blobtail: incremental ingestion of append-style logs from a blob container.
//!
//! Each poll lists recently modified blobs and emits only the bytes appended
//! since the last poll. Progress is kept either in a checkpoint table, which
//! makes restarts resume where they left off, or not at all, in which case
//! timed leases keep concurrent instances off the same blob.
//!
//! # Example
//!
//! ```ignore
//! use blobtail::{Config, run};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), blobtail::error::AppError> {
//!     let config = Config::from_file("blobtail.yaml").unwrap();
//!     run(config, CancellationToken::new()).await
//! }
//! ```

pub mod app;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod sink;
pub mod storage;

pub use app::{build_cycle, run};
pub use config::Config;
pub use ingest::{CycleStats, IngestionCycle};
