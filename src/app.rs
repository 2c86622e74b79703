//! Wiring configuration into a running ingester.

use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::{CheckpointStoreRef, ObjectStoreTable};
use crate::codec;
use crate::config::Config;
use crate::error::{AppCheckpointSnafu, AppError, AppSinkSnafu, AppStorageSnafu};
use crate::ingest::{IngestionCycle, LeaseLocker, ObjectLister, Tracking};
use crate::polling::PollScheduler;
use crate::sink::{self, EventSinkRef};
use crate::storage::{BlobClientRef, ObjectStoreBlobClient};

/// Build an initialized cycle from `config`, delivering to `sink`.
///
/// Fails when a client cannot be constructed or the checkpoint table cannot
/// be created.
pub async fn build_cycle(config: &Config, sink: EventSinkRef) -> Result<IngestionCycle, AppError> {
    let client: BlobClientRef = Arc::new(
        ObjectStoreBlobClient::from_config(&config.storage, config.source.page_size)
            .context(AppStorageSnafu)?,
    );

    let tracking = match &config.checkpoint {
        Some(checkpoint) => {
            let store: CheckpointStoreRef = Arc::new(
                ObjectStoreTable::from_config(checkpoint, &config.storage, config.source.page_size)
                    .context(AppCheckpointSnafu)?,
            );
            Tracking::Checkpoint {
                store,
                table: checkpoint.table.clone(),
            }
        }
        None => Tracking::Lease(LeaseLocker::from_config(Arc::clone(&client), &config.lease)),
    };

    let lister = ObjectLister::from_config(Arc::clone(&client), &config.source);
    IngestionCycle::new(
        client,
        lister,
        tracking,
        codec::from_kind(config.source.codec),
        sink,
    )
    .with_start_position(config.source.start_position)
    .with_add_fields(config.source.add_fields.clone())
    .initialize()
    .await
    .context(AppCheckpointSnafu)
}

/// Poll the configured container until `shutdown` is cancelled.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), AppError> {
    let sink = sink::from_config(&config.sink)
        .await
        .context(AppSinkSnafu)?;
    let mut cycle = build_cycle(&config, sink).await?;

    info!(
        container = %config.storage.container,
        mode = if config.checkpoint.is_some() { "checkpoint" } else { "lease" },
        interval_secs = config.source.poll_interval_secs,
        "Ingester started"
    );

    PollScheduler::new(config.source.poll_interval())
        .run(&mut cycle, shutdown)
        .await;

    info!("Ingester stopped");
    Ok(())
}
