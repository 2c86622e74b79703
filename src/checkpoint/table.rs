//! Checkpoint table stored as JSON entities in an object store.
//!
//! Layout: `<table>/.table` marks the table, each entity lives at
//! `<table>/<partition>/<row>.json`. Upserts are read-merge-write cycles
//! guarded by the entity tag of the version that was read.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde_json::Value;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{CheckpointConfig, StorageConfig};
use crate::error::{
    CheckpointError, EntityParseSnafu, EntitySerializeSnafu, InvalidContinuationSnafu,
    TableOpenSnafu, TableStoreSnafu, UpsertConflictSnafu,
};
use crate::storage::{AzureConfig, BackendConfig};

use super::{CheckpointRecord, CheckpointStore, RecordPage};

const TABLE_MARKER: &str = ".table";
const ENTITY_SUFFIX: &str = ".json";
const MAX_UPSERT_ATTEMPTS: usize = 5;

/// [`CheckpointStore`] over an `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreTable {
    store: Arc<dyn ObjectStore>,
    /// `None` returns a whole partition as a single page.
    page_size: Option<usize>,
}

impl std::fmt::Debug for ObjectStoreTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreTable")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreTable {
    pub fn new(store: Arc<dyn ObjectStore>, page_size: Option<usize>) -> Self {
        Self { store, page_size }
    }

    /// Open the table location named by `checkpoint`.
    ///
    /// Without an explicit location the table lives in the storage account's
    /// blob service, in a container named after the lowercased table.
    pub fn from_config(
        checkpoint: &CheckpointConfig,
        storage: &StorageConfig,
        page_size: usize,
    ) -> Result<Self, CheckpointError> {
        let backend = match &checkpoint.location {
            Some(url) => BackendConfig::parse_url(url, storage).context(TableOpenSnafu)?,
            None => BackendConfig::Azure(AzureConfig {
                account: storage.account.clone(),
                access_key: storage.access_key.clone(),
                container: checkpoint.table.to_lowercase(),
                endpoint: storage.endpoint.clone(),
            }),
        };
        let store = backend.build_store().context(TableOpenSnafu)?;
        Ok(Self::new(store, backend.lists_in_order().then_some(page_size)))
    }

    fn partition_path(table: &str, partition: &str) -> Path {
        Path::from_iter([table, partition])
    }

    fn entity_path(table: &str, record: &CheckpointRecord) -> Path {
        let file = format!("{}{ENTITY_SUFFIX}", record.row_key);
        Path::from_iter([table, record.partition_key.as_str(), file.as_str()])
    }

    async fn read_entity(&self, path: &Path) -> Result<CheckpointRecord, CheckpointError> {
        let bytes = self
            .store
            .get(path)
            .await
            .context(TableStoreSnafu)?
            .bytes()
            .await
            .context(TableStoreSnafu)?;
        serde_json::from_slice(&bytes).context(EntityParseSnafu {
            key: path.to_string(),
        })
    }

    async fn write(
        &self,
        path: &Path,
        body: Vec<u8>,
        mode: PutMode,
    ) -> Result<(), object_store::Error> {
        let payload = PutPayload::from(Bytes::from(body));
        match self
            .store
            .put_opts(path, payload.clone(), PutOptions::from(mode))
            .await
        {
            // Backends without conditional updates (local filesystem) fall
            // back to a plain overwrite.
            Err(object_store::Error::NotImplemented { .. }) => {
                self.store.put(path, payload).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }
}

/// Overlay the non-null fields of `update` onto `existing`.
fn merge_entity(existing: Value, update: Value) -> Value {
    match (existing, update) {
        (Value::Object(mut base), Value::Object(fields)) => {
            for (key, value) in fields {
                if !value.is_null() {
                    base.insert(key, value);
                }
            }
            Value::Object(base)
        }
        (_, update) => update,
    }
}

#[async_trait]
impl CheckpointStore for ObjectStoreTable {
    async fn ensure_table(&self, table: &str) -> Result<(), CheckpointError> {
        let marker = Path::from_iter([table, TABLE_MARKER]);
        let options = PutOptions::from(PutMode::Create);
        match self
            .store
            .put_opts(&marker, PutPayload::from(Bytes::new()), options)
            .await
        {
            Ok(_) => {
                debug!(table, "Created checkpoint table");
                Ok(())
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!(table, "Checkpoint table already exists");
                Ok(())
            }
            Err(source) => Err(CheckpointError::TableStore { source }),
        }
    }

    async fn query_partition_page(
        &self,
        table: &str,
        partition: &str,
        continuation: Option<&str>,
    ) -> Result<RecordPage, CheckpointError> {
        let prefix = Self::partition_path(table, partition);
        let mut listing = match continuation {
            Some(token) => {
                let offset = Path::parse(token).context(InvalidContinuationSnafu { token })?;
                self.store.list_with_offset(Some(&prefix), &offset)
            }
            None => self.store.list(Some(&prefix)),
        };

        let mut paths = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.context(TableStoreSnafu)?;
            if !meta.location.as_ref().ends_with(ENTITY_SUFFIX) {
                continue;
            }
            paths.push(meta.location);
            if self.page_size.is_some_and(|size| paths.len() >= size) {
                break;
            }
        }

        let full = self.page_size.is_some_and(|size| paths.len() >= size);
        let continuation = full.then(|| paths.last().map(|p| p.to_string())).flatten();

        let mut records = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.read_entity(path).await {
                Ok(record) => records.push(record),
                // Deleted between list and read.
                Err(CheckpointError::TableStore {
                    source: object_store::Error::NotFound { .. },
                }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(RecordPage {
            records,
            continuation,
        })
    }

    async fn upsert(&self, table: &str, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = Self::entity_path(table, record);
        let update = serde_json::to_value(record).context(EntitySerializeSnafu)?;

        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            let (body, mode) = match self.store.get(&path).await {
                Ok(current) => {
                    let version = UpdateVersion {
                        e_tag: current.meta.e_tag.clone(),
                        version: current.meta.version.clone(),
                    };
                    let bytes = current.bytes().await.context(TableStoreSnafu)?;
                    let existing: Value =
                        serde_json::from_slice(&bytes).context(EntityParseSnafu {
                            key: path.to_string(),
                        })?;
                    let merged = merge_entity(existing, update.clone());
                    (
                        serde_json::to_vec(&merged).context(EntitySerializeSnafu)?,
                        PutMode::Update(version),
                    )
                }
                Err(object_store::Error::NotFound { .. }) => (
                    serde_json::to_vec(&update).context(EntitySerializeSnafu)?,
                    PutMode::Create,
                ),
                Err(source) => return Err(CheckpointError::TableStore { source }),
            };

            match self.write(&path, body, mode).await {
                Ok(()) => return Ok(()),
                Err(object_store::Error::AlreadyExists { .. })
                | Err(object_store::Error::Precondition { .. }) => {
                    warn!(row_key = %record.row_key, attempt, "Checkpoint changed underneath upsert, retrying");
                }
                Err(source) => return Err(CheckpointError::TableStore { source }),
            }
        }

        UpsertConflictSnafu {
            row_key: record.row_key.clone(),
            attempts: MAX_UPSERT_ATTEMPTS,
        }
        .fail()
    }
}
