//! Single-claim locking for deployments without a checkpoint table.
//!
//! Each blob is guarded by a `<name>.lock` marker holding a timed lease.
//! Leases are never released here; they run out on their own.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::listing::Listing;
use super::until_cancelled;
use crate::config::LeaseConfig;
use crate::emit;
use crate::error::IngestError;
use crate::metrics::events::{LockAttempted, LockOutcome};
use crate::storage::{BlobClientRef, ObjectDescriptor};

/// Suffix of lock marker names.
pub const LOCK_SUFFIX: &str = ".lock";

/// Best-effort mutual exclusion over one blob at a time.
#[derive(Clone)]
pub struct LeaseLocker {
    client: BlobClientRef,
    lease_duration: Duration,
    acquire_timeout: Duration,
}

impl LeaseLocker {
    pub fn new(client: BlobClientRef, lease_duration: Duration, acquire_timeout: Duration) -> Self {
        Self {
            client,
            lease_duration,
            acquire_timeout,
        }
    }

    pub fn from_config(client: BlobClientRef, config: &LeaseConfig) -> Self {
        Self::new(
            client,
            Duration::from_secs(config.duration_secs),
            Duration::from_secs(config.acquire_timeout_secs),
        )
    }

    /// Try to lease `lock_name`, creating the marker if needed.
    ///
    /// Every failure other than shutdown reads as "not acquired".
    pub async fn acquire(
        &self,
        lock_name: &str,
        shutdown: &CancellationToken,
    ) -> Result<bool, IngestError> {
        let owner = Uuid::new_v4().to_string();

        let attempt = async {
            self.client.create_marker(lock_name).await?;
            self.client
                .acquire_lease(lock_name, self.lease_duration, self.acquire_timeout, &owner)
                .await
        };

        let acquired = match until_cancelled(shutdown, attempt).await? {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(lock = lock_name, error = %e, "Failed to acquire lock");
                false
            }
        };

        emit!(LockAttempted {
            outcome: if acquired {
                LockOutcome::Acquired
            } else {
                LockOutcome::Contended
            },
        });
        Ok(acquired)
    }

    /// Claim the first listed blob that is not a lock marker, has no marker
    /// in the listing and whose lease can be taken.
    ///
    /// The marker check only avoids obvious contention; the lease is what
    /// actually serializes instances.
    pub async fn claim_one(
        &self,
        listing: &Listing,
        shutdown: &CancellationToken,
    ) -> Result<Option<ObjectDescriptor>, IngestError> {
        for blob in listing.iter().filter(|b| !b.name.ends_with(LOCK_SUFFIX)) {
            let lock_name = format!("{}{LOCK_SUFFIX}", blob.name);
            if listing.contains(&lock_name) {
                debug!(blob = %blob.name, "Lock marker present, skipping");
                continue;
            }

            if self.acquire(&lock_name, shutdown).await? {
                info!(blob = %blob.name, "Claimed blob");
                return Ok(Some(blob.clone()));
            }
            debug!(blob = %blob.name, "Lock contended");
        }

        Ok(None)
    }
}

impl std::fmt::Debug for LeaseLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLocker")
            .field("lease_duration", &self.lease_duration)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}
