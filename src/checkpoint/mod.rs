//! Durable per-blob read progress.
//!
//! A [`CheckpointRecord`] remembers how far into a blob we have read and
//! which version of the blob that offset belongs to. Records live in a
//! table partitioned by container and keyed by the encoded blob name.
//!
//! The core only relies on the [`CheckpointStore`] contract; [`ObjectStoreTable`]
//! is the bundled implementation.

mod table;

pub use table::ObjectStoreTable;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CheckpointError, RowKeyDecodeSnafu, RowKeyUtf8Snafu};
use crate::storage::display_name;

/// A reference-counted checkpoint store.
pub type CheckpointStoreRef = Arc<dyn CheckpointStore>;

/// Persisted progress marker for one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointRecord {
    /// Container name.
    pub partition_key: String,
    /// Encoded blob name, see [`encode_row_key`].
    pub row_key: String,
    /// Bytes already read and emitted.
    pub byte_offset: u64,
    /// Entity tag of the blob version `byte_offset` belongs to.
    #[serde(rename = "ETag", default)]
    pub entity_tag: Option<String>,
    /// Decoded blob name, kept for humans.
    pub blob_name: String,
}

impl CheckpointRecord {
    /// Record for `blob_name` in `container` at `byte_offset`.
    pub fn new(
        container: &str,
        blob_name: &str,
        byte_offset: u64,
        entity_tag: Option<String>,
    ) -> Self {
        Self {
            partition_key: container.to_string(),
            row_key: encode_row_key(blob_name),
            byte_offset,
            entity_tag,
            blob_name: display_name(blob_name),
        }
    }
}

/// One page of a partition query.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<CheckpointRecord>,
    /// `None` marks the final page.
    pub continuation: Option<String>,
}

/// Encode a blob name as a row key.
///
/// URL-safe base64 is reversible, collision-free and never contains `/`,
/// which table keys and object paths both reject.
pub fn encode_row_key(blob_name: &str) -> String {
    URL_SAFE.encode(blob_name.as_bytes())
}

/// Decode a row key back into the blob name.
pub fn decode_row_key(row_key: &str) -> Result<String, CheckpointError> {
    let bytes = URL_SAFE
        .decode(row_key)
        .context(RowKeyDecodeSnafu { row_key })?;
    String::from_utf8(bytes).context(RowKeyUtf8Snafu { row_key })
}

/// Durable checkpoint table.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the table. An existing table is not an error.
    async fn ensure_table(&self, table: &str) -> Result<(), CheckpointError>;

    /// Fetch one page of the records in `partition`.
    async fn query_partition_page(
        &self,
        table: &str,
        partition: &str,
        continuation: Option<&str>,
    ) -> Result<RecordPage, CheckpointError>;

    /// Insert `record`, or merge its fields into the stored one.
    async fn upsert(&self, table: &str, record: &CheckpointRecord) -> Result<(), CheckpointError>;
}

/// Read every record in `partition`, following continuation tokens.
///
/// Returns records keyed by row key.
pub async fn query_partition(
    store: &dyn CheckpointStore,
    table: &str,
    partition: &str,
) -> Result<HashMap<String, CheckpointRecord>, CheckpointError> {
    let mut records = HashMap::new();
    let mut continuation: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = store
            .query_partition_page(table, partition, continuation.as_deref())
            .await?;
        pages += 1;
        records.extend(page.records.into_iter().map(|r| (r.row_key.clone(), r)));

        match page.continuation {
            Some(token) if !token.is_empty() => continuation = Some(token),
            _ => break,
        }
    }

    debug!(table, partition, pages, records = records.len(), "Loaded checkpoints");
    Ok(records)
}
