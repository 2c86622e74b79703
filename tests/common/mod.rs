//! Recording test doubles for the ingestion engine.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::memory::InMemory;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blobtail::checkpoint::{
    CheckpointRecord, CheckpointStore, ObjectStoreTable, RecordPage, encode_row_key,
    query_partition,
};
use blobtail::codec::{self, Event};
use blobtail::config::{CodecKind, StartPosition};
use blobtail::error::{CheckpointError, ClosedSnafu, SinkError, StorageError};
use blobtail::ingest::{IngestionCycle, LeaseLocker, ObjectLister, Tracking};
use blobtail::sink::EventSink;
use blobtail::storage::{BlobClient, FetchedBlob, ListPage, ObjectDescriptor};

pub const CONTAINER: &str = "logs";
pub const TABLE: &str = "sincedb";

#[derive(Debug, Clone)]
struct FakeBlob {
    bytes: Vec<u8>,
    tag: String,
    last_modified: DateTime<Utc>,
}

/// A fetch observed by [`FakeBlobClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Range { name: String, start: u64, end: u64 },
    Whole { name: String },
}

/// In-memory container that records every call.
pub struct FakeBlobClient {
    blobs: Mutex<BTreeMap<String, FakeBlob>>,
    page_size: usize,
    list_calls: Mutex<Vec<(String, Option<String>)>>,
    fetches: Mutex<Vec<Fetch>>,
    lease_attempts: Mutex<Vec<String>>,
    refused_leases: Mutex<HashSet<String>>,
    held_leases: Mutex<HashSet<String>>,
    failing_fetches: Mutex<HashSet<String>>,
}

impl FakeBlobClient {
    pub fn new(page_size: usize) -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            page_size,
            list_calls: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            lease_attempts: Mutex::new(Vec::new()),
            refused_leases: Mutex::new(HashSet::new()),
            held_leases: Mutex::new(HashSet::new()),
            failing_fetches: Mutex::new(HashSet::new()),
        }
    }

    /// Create or replace a blob modified just now.
    pub fn put(&self, name: &str, bytes: &[u8], tag: &str) {
        self.put_at(name, bytes, tag, Utc::now());
    }

    pub fn put_at(&self, name: &str, bytes: &[u8], tag: &str, last_modified: DateTime<Utc>) {
        self.blobs.lock().unwrap().insert(
            name.to_string(),
            FakeBlob {
                bytes: bytes.to_vec(),
                tag: tag.to_string(),
                last_modified,
            },
        );
    }

    /// Append to an existing blob, giving it a new tag.
    pub fn append(&self, name: &str, more: &[u8], tag: &str) {
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs.get_mut(name).expect("blob exists");
        blob.bytes.extend_from_slice(more);
        blob.tag = tag.to_string();
        blob.last_modified = Utc::now();
    }

    pub fn refuse_lease(&self, lock_name: &str) {
        self.refused_leases
            .lock()
            .unwrap()
            .insert(lock_name.to_string());
    }

    pub fn fail_fetches_of(&self, name: &str) {
        self.failing_fetches.lock().unwrap().insert(name.to_string());
    }

    pub fn list_calls(&self) -> Vec<(String, Option<String>)> {
        self.list_calls.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> Vec<Fetch> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn lease_attempts(&self) -> Vec<String> {
        self.lease_attempts.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.list_calls.lock().unwrap().clear();
        self.fetches.lock().unwrap().clear();
        self.lease_attempts.lock().unwrap().clear();
    }

    fn descriptor(name: &str, blob: &FakeBlob) -> ObjectDescriptor {
        ObjectDescriptor {
            name: name.to_string(),
            last_modified: blob.last_modified,
            entity_tag: blob.tag.clone(),
            content_length: blob.bytes.len() as u64,
        }
    }

    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<FetchedBlob, StorageError> {
        if self.failing_fetches.lock().unwrap().contains(name) {
            return Err(StorageError::Timeout {
                operation: "get",
                secs: 0,
            });
        }
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs.get(name).ok_or_else(|| StorageError::ObjectStore {
            source: object_store::Error::NotFound {
                path: name.to_string(),
                source: "no such blob".into(),
            },
        })?;
        let bytes = match range {
            Some((start, end)) => blob.bytes[start as usize..end as usize].to_vec(),
            None => blob.bytes.clone(),
        };
        Ok(FetchedBlob {
            bytes: Bytes::from(bytes),
            descriptor: Self::descriptor(name, blob),
        })
    }
}

#[async_trait]
impl BlobClient for FakeBlobClient {
    fn container(&self) -> &str {
        CONTAINER
    }

    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
        _timeout: Duration,
    ) -> Result<ListPage, StorageError> {
        self.list_calls
            .lock()
            .unwrap()
            .push((prefix.to_string(), token.map(String::from)));

        let blobs = self.blobs.lock().unwrap();
        let mut remaining = blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| token.is_none_or(|t| name.as_str() > t));

        let entries: Vec<ObjectDescriptor> = remaining
            .by_ref()
            .take(self.page_size)
            .map(|(name, blob)| Self::descriptor(name, blob))
            .collect();
        let next_token = match remaining.next() {
            Some(_) => entries.last().map(|e| e.name.clone()),
            None => None,
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn get_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<FetchedBlob, StorageError> {
        self.fetches.lock().unwrap().push(Fetch::Range {
            name: name.to_string(),
            start,
            end,
        });
        self.read(name, Some((start, end)))
    }

    async fn get(&self, name: &str) -> Result<FetchedBlob, StorageError> {
        self.fetches.lock().unwrap().push(Fetch::Whole {
            name: name.to_string(),
        });
        self.read(name, None)
    }

    async fn create_marker(&self, name: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.entry(name.to_string()).or_insert_with(|| FakeBlob {
            bytes: Vec::new(),
            tag: "marker".to_string(),
            last_modified: Utc::now(),
        });
        Ok(())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        _duration: Duration,
        _timeout: Duration,
        _owner: &str,
    ) -> Result<bool, StorageError> {
        self.lease_attempts.lock().unwrap().push(name.to_string());
        if self.refused_leases.lock().unwrap().contains(name) {
            return Ok(false);
        }
        Ok(self.held_leases.lock().unwrap().insert(name.to_string()))
    }
}

/// Real object-store-backed table that counts upserts.
pub struct RecordingCheckpointStore {
    inner: ObjectStoreTable,
    upserts: AtomicUsize,
    queries: AtomicUsize,
}

impl RecordingCheckpointStore {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreTable::new(Arc::new(InMemory::new()), Some(2)),
            upserts: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn page_queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Stored record for `blob`, if any.
    pub async fn record(&self, blob: &str) -> Option<CheckpointRecord> {
        query_partition(&self.inner, TABLE, CONTAINER)
            .await
            .unwrap()
            .remove(&encode_row_key(blob))
    }

    /// Seed a record without counting it as an upsert.
    pub async fn seed(&self, blob: &str, offset: u64, tag: &str) {
        let record = CheckpointRecord::new(CONTAINER, blob, offset, Some(tag.to_string()));
        self.inner.upsert(TABLE, &record).await.unwrap();
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpointStore {
    async fn ensure_table(&self, table: &str) -> Result<(), CheckpointError> {
        self.inner.ensure_table(table).await
    }

    async fn query_partition_page(
        &self,
        table: &str,
        partition: &str,
        continuation: Option<&str>,
    ) -> Result<RecordPage, CheckpointError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner
            .query_partition_page(table, partition, continuation)
            .await
    }

    async fn upsert(&self, table: &str, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(table, record).await
    }
}

/// Collects events, optionally refusing everything after `fail_after`.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
    fail_after: Option<usize>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(accepted: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_after: Some(accepted),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()).map(String::from))
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn accept(&self, event: Event) -> Result<(), SinkError> {
        let mut events = self.events.lock().unwrap();
        if self.fail_after.is_some_and(|limit| events.len() >= limit) {
            return ClosedSnafu.fail();
        }
        events.push(event);
        Ok(())
    }
}

/// Collaborators shared by a test and the cycle under test.
pub struct Harness {
    pub client: Arc<FakeBlobClient>,
    pub store: Arc<RecordingCheckpointStore>,
    pub sink: Arc<CollectingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_sink(CollectingSink::new())
    }

    pub fn with_sink(sink: CollectingSink) -> Self {
        Self {
            client: Arc::new(FakeBlobClient::new(100)),
            store: Arc::new(RecordingCheckpointStore::new()),
            sink: Arc::new(sink),
        }
    }

    fn lister(&self) -> ObjectLister {
        ObjectLister::new(self.client.clone(), vec![String::new()], Duration::from_secs(3600))
    }

    /// Cycle tracking progress in the recording checkpoint store.
    pub async fn checkpoint_cycle(&self, start_position: StartPosition) -> IngestionCycle {
        self.checkpoint_cycle_with(start_position, CodecKind::Line)
            .await
    }

    pub async fn checkpoint_cycle_with(
        &self,
        start_position: StartPosition,
        codec: CodecKind,
    ) -> IngestionCycle {
        let tracking = Tracking::Checkpoint {
            store: self.store.clone(),
            table: TABLE.to_string(),
        };
        IngestionCycle::new(
            self.client.clone(),
            self.lister(),
            tracking,
            codec::from_kind(codec),
            self.sink.clone(),
        )
        .with_start_position(start_position)
        .initialize()
        .await
        .unwrap()
    }

    /// Cycle using lease locking.
    pub fn lease_cycle(&self) -> IngestionCycle {
        let locker = LeaseLocker::new(
            self.client.clone(),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        IngestionCycle::new(
            self.client.clone(),
            self.lister(),
            Tracking::Lease(locker),
            codec::from_kind(CodecKind::Line),
            self.sink.clone(),
        )
    }
}
