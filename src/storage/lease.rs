//! Exclusive, time-bounded leases on marker objects.
//!
//! `object_store` exposes no native blob leases, so a lease is a small JSON
//! document written into the marker object itself. Conditional writes keep
//! it exclusive: a fresh marker is claimed with `PutMode::Create`, an
//! existing one with `PutMode::Update` pinned to the entity tag that was
//! read. Whoever loses the race sees `AlreadyExists` or `Precondition`.
//! A lease expires on its own once `expires_at` has passed.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::StorageError;

/// Lease state stored inside a marker object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDocument {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaseDocument {
    fn new(owner: &str, duration: Duration, now: DateTime<Utc>) -> Self {
        let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Self {
            owner: owner.to_string(),
            expires_at: now.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether this lease still excludes `owner` at `now`.
    pub fn blocks(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner != owner && self.expires_at > now
    }

    /// Parse marker content. Empty or foreign content holds no lease.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    fn payload(&self) -> PutPayload {
        // Serializing a struct of a string and a timestamp cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        PutPayload::from(Bytes::from(json))
    }
}

/// Try to take the lease on `path` for `owner`.
pub(super) async fn acquire(
    store: &dyn ObjectStore,
    path: &Path,
    duration: Duration,
    owner: &str,
) -> Result<bool, StorageError> {
    let now = Utc::now();
    let lease = LeaseDocument::new(owner, duration, now);

    let current = match store.get(path).await {
        Ok(current) => current,
        Err(object_store::Error::NotFound { .. }) => {
            let options = PutOptions::from(PutMode::Create);
            return match store.put_opts(path, lease.payload(), options).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
                Err(source) => Err(StorageError::ObjectStore { source }),
            };
        }
        Err(source) => return Err(StorageError::ObjectStore { source }),
    };

    let version = UpdateVersion {
        e_tag: current.meta.e_tag.clone(),
        version: current.meta.version.clone(),
    };
    let content = current
        .bytes()
        .await
        .map_err(|source| StorageError::ObjectStore { source })?;

    if let Some(held) = LeaseDocument::parse(&content)
        && held.blocks(owner, now)
    {
        debug!(path = %path, holder = %held.owner, expires_at = %held.expires_at, "Lease is held");
        return Ok(false);
    }

    let options = PutOptions::from(PutMode::Update(version));
    match store.put_opts(path, lease.payload(), options).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::Precondition { .. }) => Ok(false),
        // No conditional updates (local filesystem): last writer wins.
        Err(object_store::Error::NotImplemented { .. }) => store
            .put(path, lease.payload())
            .await
            .map(|_| true)
            .map_err(|source| StorageError::ObjectStore { source }),
        Err(source) => Err(StorageError::ObjectStore { source }),
    }
}
