//! One polling cycle.
//!
//! A cycle lists candidate blobs, then either resumes each one from its
//! checkpoint or claims a single blob through a lease and reads it whole.
//! Events go to the sink as they are decoded. Any failure other than
//! shutdown ends the cycle early; the next cycle retries.

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::listing::ObjectLister;
use super::locker::LeaseLocker;
use super::resume::{self, ReadPlan};
use super::until_cancelled;
use crate::checkpoint::{
    CheckpointRecord, CheckpointStoreRef, encode_row_key, query_partition,
};
use crate::codec::Codec;
use crate::config::StartPosition;
use crate::emit;
use crate::error::{
    CheckpointError, CheckpointSnafu, DecodeSnafu, EmitSnafu, FetchSnafu, IngestError,
    ShutdownRequestedSnafu,
};
use crate::metrics::events::{
    BlobSkipped, BytesFetched, CheckpointWritten, CycleFinished, CycleStatus, EventsEmitted,
};
use crate::polling::{IterationResult, PollingProcessor};
use crate::sink::EventSinkRef;
use crate::storage::{BlobClientRef, ObjectDescriptor, display_name};

/// How progress is tracked across cycles.
#[derive(Clone)]
pub enum Tracking {
    /// Resume every blob from its record in `table`.
    Checkpoint {
        store: CheckpointStoreRef,
        table: String,
    },
    /// Claim one blob per cycle and read it whole.
    Lease(LeaseLocker),
}

impl std::fmt::Debug for Tracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tracking::Checkpoint { table, .. } => {
                f.debug_struct("Checkpoint").field("table", table).finish()
            }
            Tracking::Lease(locker) => f.debug_tuple("Lease").field(locker).finish(),
        }
    }
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Candidates that survived the staleness filter.
    pub listed: usize,
    /// Blobs fetched and emitted.
    pub processed: usize,
    /// Blobs whose checkpoint was already current.
    pub skipped: usize,
    pub events: u64,
    pub bytes: u64,
    /// The cycle ended early on an error.
    pub aborted: bool,
}

/// Orchestrates one poll against its collaborators.
pub struct IngestionCycle {
    client: BlobClientRef,
    lister: ObjectLister,
    tracking: Tracking,
    codec: Box<dyn Codec>,
    sink: EventSinkRef,
    start_position: StartPosition,
    add_fields: HashMap<String, String>,
}

impl IngestionCycle {
    pub fn new(
        client: BlobClientRef,
        lister: ObjectLister,
        tracking: Tracking,
        codec: Box<dyn Codec>,
        sink: EventSinkRef,
    ) -> Self {
        Self {
            client,
            lister,
            tracking,
            codec,
            sink,
            start_position: StartPosition::default(),
            add_fields: HashMap::new(),
        }
    }

    /// Where blobs without a checkpoint are first read from.
    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Static fields merged into every event.
    pub fn with_add_fields(mut self, add_fields: HashMap<String, String>) -> Self {
        self.add_fields = add_fields;
        self
    }

    /// Prepare the tracking backend. Creates the checkpoint table if needed.
    pub async fn initialize(self) -> Result<Self, CheckpointError> {
        if let Tracking::Checkpoint { store, table } = &self.tracking {
            store.ensure_table(table).await?;
            info!(table = %table, "Checkpoint table ready");
        }
        Ok(self)
    }

    /// Run one cycle.
    ///
    /// Only [`IngestError::ShutdownRequested`] is returned; every other
    /// error is logged and reported through [`CycleStats::aborted`].
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<CycleStats, IngestError> {
        let started = Instant::now();
        let mut stats = CycleStats::default();

        let result = self.execute(shutdown, &mut stats).await;
        let status = match result {
            Ok(()) => CycleStatus::Completed,
            Err(e) if e.is_shutdown() => {
                emit!(CycleFinished {
                    status: CycleStatus::Shutdown,
                    duration: started.elapsed(),
                });
                return Err(e);
            }
            Err(e) => {
                error!(
                    container = self.client.container(),
                    error = %snafu::Report::from_error(e),
                    "Cycle aborted"
                );
                stats.aborted = true;
                CycleStatus::Aborted
            }
        };

        emit!(CycleFinished {
            status,
            duration: started.elapsed(),
        });
        Ok(stats)
    }

    async fn execute(
        &self,
        shutdown: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<(), IngestError> {
        ensure!(!shutdown.is_cancelled(), ShutdownRequestedSnafu);

        let listing = self.lister.list(shutdown).await?;
        stats.listed = listing.len();

        match &self.tracking {
            Tracking::Checkpoint { store, table } => {
                let partition = self.client.container();
                let records =
                    until_cancelled(shutdown, query_partition(store.as_ref(), table, partition))
                        .await?
                        .context(CheckpointSnafu)?;

                for blob in listing.iter() {
                    ensure!(!shutdown.is_cancelled(), ShutdownRequestedSnafu);
                    let existing = records.get(&encode_row_key(&blob.name));
                    self.resume_blob(store, table, blob, existing, shutdown, stats)
                        .await?;
                }
            }
            Tracking::Lease(locker) => {
                let Some(blob) = locker.claim_one(&listing, shutdown).await? else {
                    debug!(container = self.client.container(), "No blob claimed");
                    return Ok(());
                };

                info!(blob = %blob.name, "Processing");
                let fetched = until_cancelled(shutdown, self.client.get(&blob.name))
                    .await?
                    .context(FetchSnafu { name: &blob.name })?;
                self.emit_all(&blob.name, &fetched.bytes, shutdown, stats)
                    .await?;
                stats.processed += 1;
            }
        }

        Ok(())
    }

    async fn resume_blob(
        &self,
        store: &CheckpointStoreRef,
        table: &str,
        blob: &ObjectDescriptor,
        existing: Option<&CheckpointRecord>,
        shutdown: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<(), IngestError> {
        let offset = match resume::plan(existing, blob, self.start_position) {
            ReadPlan::Skip => {
                debug!(blob = %blob.name, etag = %blob.entity_tag, "Unchanged, skipping");
                emit!(BlobSkipped);
                stats.skipped += 1;
                return Ok(());
            }
            ReadPlan::Advance { offset } => {
                debug!(blob = %blob.name, offset, "No new bytes");
                offset
            }
            ReadPlan::Read { start, end } => {
                info!(blob = %blob.name, start, end, "Processing");
                let fetched =
                    until_cancelled(shutdown, self.client.get_range(&blob.name, start, end))
                        .await?
                        .context(FetchSnafu { name: &blob.name })?;
                self.emit_all(&blob.name, &fetched.bytes, shutdown, stats)
                    .await?;
                stats.processed += 1;
                end
            }
        };

        // Runs to completion on shutdown so emitted events are always recorded.
        let record = CheckpointRecord::new(
            self.client.container(),
            &blob.name,
            offset,
            Some(blob.entity_tag.clone()),
        );
        store
            .upsert(table, &record)
            .await
            .context(CheckpointSnafu)?;
        emit!(CheckpointWritten);
        debug!(blob = %blob.name, offset, "Checkpoint written");
        Ok(())
    }

    /// Decode `bytes` and hand every event to the sink, then flush.
    async fn emit_all(
        &self,
        name: &str,
        bytes: &Bytes,
        shutdown: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<(), IngestError> {
        emit!(BytesFetched {
            bytes: bytes.len() as u64
        });
        stats.bytes += bytes.len() as u64;

        let container = self.client.container();
        let blob = display_name(name);
        let mut count = 0u64;
        for event in self.codec.decode(bytes) {
            let mut event = event.context(DecodeSnafu { name })?;
            event.decorate(container, &blob, &self.add_fields);
            until_cancelled(shutdown, self.sink.accept(event))
                .await?
                .context(EmitSnafu { name })?;
            count += 1;
        }
        until_cancelled(shutdown, self.sink.flush())
            .await?
            .context(EmitSnafu { name })?;

        emit!(EventsEmitted { count });
        stats.events += count;
        debug!(blob = name, events = count, "Events emitted");
        Ok(())
    }
}

#[async_trait]
impl PollingProcessor for IngestionCycle {
    async fn poll(&mut self, shutdown: &CancellationToken) -> IterationResult {
        match self.run_once(shutdown).await {
            Ok(stats) if stats.processed > 0 => {
                info!(
                    listed = stats.listed,
                    processed = stats.processed,
                    skipped = stats.skipped,
                    events = stats.events,
                    bytes = stats.bytes,
                    "Cycle complete"
                );
                IterationResult::ProcessedItems
            }
            Ok(_) => IterationResult::NoItems,
            Err(_) => IterationResult::Shutdown,
        }
    }
}
