//! Container enumeration.

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::until_cancelled;
use crate::config::SourceConfig;
use crate::emit;
use crate::error::{IngestError, ListingSnafu, PageLimitExceededSnafu};
use crate::metrics::events::BlobsListed;
use crate::storage::{BlobClientRef, ObjectDescriptor};

/// Result of one listing pass: blobs keyed by name, in listing order.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    entries: Vec<ObjectDescriptor>,
    index: HashMap<String, usize>,
}

impl Listing {
    /// Add `descriptor` unless a blob with the same name is already present.
    pub fn insert(&mut self, descriptor: ObjectDescriptor) -> bool {
        if self.index.contains_key(&descriptor.name) {
            return false;
        }
        self.index
            .insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(descriptor);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ObjectDescriptor> {
        self.index.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectDescriptor> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<ObjectDescriptor> for Listing {
    fn from_iter<I: IntoIterator<Item = ObjectDescriptor>>(iter: I) -> Self {
        let mut listing = Listing::default();
        for descriptor in iter {
            listing.insert(descriptor);
        }
        listing
    }
}

/// Enumerates recently modified blobs under a set of prefixes.
#[derive(Clone)]
pub struct ObjectLister {
    client: BlobClientRef,
    prefixes: Vec<String>,
    max_age: Duration,
    max_pages: usize,
    page_timeout: Duration,
}

impl ObjectLister {
    pub fn new(client: BlobClientRef, prefixes: Vec<String>, max_age: Duration) -> Self {
        Self {
            client,
            prefixes,
            max_age,
            max_pages: usize::MAX,
            page_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(client: BlobClientRef, config: &SourceConfig) -> Self {
        Self::new(client, config.path_prefixes.clone(), config.max_age())
            .with_max_pages(config.max_pages)
            .with_page_timeout(config.list_timeout())
    }

    /// Fail a prefix that has not finished after `max_pages` pages.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    /// List every prefix, keeping blobs modified within `max_age` of now.
    pub async fn list(&self, shutdown: &CancellationToken) -> Result<Listing, IngestError> {
        self.list_at(Utc::now(), shutdown).await
    }

    /// Like [`list`](Self::list) with a fixed clock reading.
    ///
    /// A blob exactly `max_age` old is kept.
    pub async fn list_at(
        &self,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<Listing, IngestError> {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        let mut listing = Listing::default();

        info!(
            container = self.client.container(),
            prefixes = ?self.prefixes,
            "Looking for blobs"
        );

        for prefix in &self.prefixes {
            let mut token: Option<String> = None;
            let mut pages = 0usize;

            loop {
                if pages >= self.max_pages {
                    return PageLimitExceededSnafu {
                        prefix: prefix.as_str(),
                        pages,
                    }
                    .fail()
                    .context(ListingSnafu);
                }

                let page = until_cancelled(
                    shutdown,
                    self.client
                        .list_page(prefix, token.as_deref(), self.page_timeout),
                )
                .await?
                .context(ListingSnafu)?;
                pages += 1;

                for entry in page.entries {
                    let age = now.signed_duration_since(entry.last_modified);
                    if age <= max_age {
                        listing.insert(entry);
                    }
                }

                match page.next_token {
                    Some(next) if !next.is_empty() => token = Some(next),
                    _ => break,
                }
            }

            debug!(prefix = %prefix, pages, "Prefix listed");
        }

        info!(
            container = self.client.container(),
            candidates = listing.len(),
            "Finished looking for blobs"
        );
        emit!(BlobsListed {
            count: listing.len() as u64
        });

        Ok(listing)
    }
}

impl std::fmt::Debug for ObjectLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLister")
            .field("container", &self.client.container())
            .field("prefixes", &self.prefixes)
            .field("max_age", &self.max_age)
            .finish()
    }
}
