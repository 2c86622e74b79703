//! Blob container access.
//!
//! The ingestion core talks to the remote container only through the
//! [`BlobClient`] trait. [`ObjectStoreBlobClient`] implements it on top of
//! any `object_store` backend: Azure Blob Storage in production, the local
//! filesystem or memory for development and tests.

mod azure;
mod lease;
mod local;

pub use azure::AzureConfig;
pub use lease::LeaseDocument;
pub use local::LocalConfig;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::{DELIMITER, Path};
use object_store::{GetOptions, GetRange, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};
use percent_encoding::percent_decode_str;
use regex::Regex;
use snafu::prelude::*;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

use crate::config::StorageConfig;
use crate::emit;
use crate::error::{
    InvalidPathSnafu, InvalidRangeSnafu, InvalidUrlSnafu, ObjectStoreSnafu, StorageError,
    TimeoutSnafu,
};
use crate::metrics::events::ListPageFetched;

/// A reference-counted blob client.
pub type BlobClientRef = Arc<dyn BlobClient>;

/// Snapshot of a remote object's identity, taken at listing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Object location as the store reports it. Segments may be
    /// percent-encoded; see [`display_name`].
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub entity_tag: String,
    pub content_length: u64,
}

impl ObjectDescriptor {
    fn from_meta(meta: ObjectMeta) -> Self {
        // Backends without entity tags get a token that still changes with content.
        let entity_tag = meta.e_tag.clone().unwrap_or_else(|| {
            format!("{}-{}", meta.size, meta.last_modified.timestamp_micros())
        });
        Self {
            name: meta.location.to_string(),
            last_modified: meta.last_modified,
            entity_tag,
            content_length: meta.size,
        }
    }
}

/// Human-readable form of an object name, with every path segment
/// percent-decoded.
pub fn display_name(name: &str) -> String {
    name.split(DELIMITER)
        .map(|part| percent_decode_str(part).decode_utf8_lossy())
        .collect::<Vec<_>>()
        .join(DELIMITER)
}

/// Rebuild the location of a listed object name without encoding it again.
fn location(name: &str) -> Result<Path, StorageError> {
    Path::parse(name).context(InvalidPathSnafu { name })
}

/// One page of a container listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectDescriptor>,
    /// `None` marks the final page.
    pub next_token: Option<String>,
}

/// Bytes read from an object plus its metadata at read time.
#[derive(Debug, Clone)]
pub struct FetchedBlob {
    pub bytes: Bytes,
    pub descriptor: ObjectDescriptor,
}

/// Object store client used by the ingestion core.
///
/// Every implementation is bound to a single container.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Name of the bound container.
    fn container(&self) -> &str;

    /// Fetch one listing page under `prefix`, continuing after `token`.
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<ListPage, StorageError>;

    /// Read the byte range `[start, end)` of an object.
    async fn get_range(&self, name: &str, start: u64, end: u64)
    -> Result<FetchedBlob, StorageError>;

    /// Read a whole object.
    async fn get(&self, name: &str) -> Result<FetchedBlob, StorageError>;

    /// Create an empty marker object unless it already exists.
    async fn create_marker(&self, name: &str) -> Result<(), StorageError>;

    /// Try to take an exclusive lease on `name`. `Ok(false)` means someone
    /// else holds it.
    async fn acquire_lease(
        &self,
        name: &str,
        duration: Duration,
        timeout: Duration,
        owner: &str,
    ) -> Result<bool, StorageError>;
}

const FILE_URI: &str = r"^file://(?P<path>/.*)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";
const MEMORY_URI: &str = r"^memory://$";
const AZURE_HTTPS: &str = r"^https://(?P<account>[a-z0-9]+)\.blob\.(?P<endpoint>[a-z0-9\.\-]+)/(?P<container>[a-z0-9\-]+)/?$";

static FILE_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(FILE_URI).expect("file uri pattern is valid"),
        Regex::new(FILE_PATH).expect("file path pattern is valid"),
    ]
});
static MEMORY_MATCHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MEMORY_URI).expect("memory pattern is valid"));
static AZURE_MATCHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(AZURE_HTTPS).expect("azure pattern is valid"));

/// Backend selected for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Azure(AzureConfig),
    Local(LocalConfig),
    Memory,
}

impl BackendConfig {
    /// Resolve the backend for the configured container.
    pub fn from_storage_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match &config.url {
            Some(url) => Self::parse_url(url, config),
            None => Ok(BackendConfig::Azure(AzureConfig {
                account: config.account.clone(),
                access_key: config.access_key.clone(),
                container: config.container.clone(),
                endpoint: config.endpoint.clone(),
            })),
        }
    }

    /// Parse a location URL. Azure URLs name their own container; credentials
    /// come from `defaults`.
    pub fn parse_url(url: &str, defaults: &StorageConfig) -> Result<Self, StorageError> {
        if MEMORY_MATCHER.is_match(url) {
            return Ok(BackendConfig::Memory);
        }
        if let Some(caps) = FILE_MATCHERS.iter().find_map(|r| r.captures(url)) {
            return Ok(BackendConfig::Local(LocalConfig {
                path: caps["path"].to_string(),
            }));
        }
        if let Some(caps) = AZURE_MATCHER.captures(url) {
            return Ok(BackendConfig::Azure(AzureConfig {
                account: caps["account"].to_string(),
                access_key: defaults.access_key.clone(),
                container: caps["container"].to_string(),
                endpoint: caps["endpoint"].to_string(),
            }));
        }
        InvalidUrlSnafu { url }.fail()
    }

    /// Build the `object_store` for this backend.
    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>, StorageError> {
        match self {
            BackendConfig::Azure(config) => config.build(),
            BackendConfig::Local(config) => config.build(),
            BackendConfig::Memory => Ok(Arc::new(InMemory::new())),
        }
    }

    /// Whether listings come back in lexicographic order, which offset-based
    /// pagination requires.
    pub(crate) fn lists_in_order(&self) -> bool {
        !matches!(self, BackendConfig::Local(_))
    }
}

/// [`BlobClient`] over an `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreBlobClient {
    store: Arc<dyn ObjectStore>,
    container: String,
    /// `None` returns every entry of a prefix as a single page.
    page_size: Option<usize>,
}

impl std::fmt::Debug for ObjectStoreBlobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreBlobClient<{}>", self.container)
    }
}

impl ObjectStoreBlobClient {
    /// Wrap an existing store.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        container: impl Into<String>,
        page_size: Option<usize>,
    ) -> Self {
        Self {
            store,
            container: container.into(),
            page_size,
        }
    }

    /// Connect to the container described by `config`.
    pub fn from_config(config: &StorageConfig, page_size: usize) -> Result<Self, StorageError> {
        let backend = BackendConfig::from_storage_config(config)?;
        let store = backend.build_store()?;
        let page_size = backend.lists_in_order().then_some(page_size);
        debug!(container = %config.container, ?backend, "Blob client created");
        Ok(Self::new(store, config.container.clone(), page_size))
    }

    async fn collect_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StorageError> {
        // object_store lists whole path segments, so list from the directory
        // part of the prefix. An empty prefix means the whole container.
        let prefix_path = prefix
            .rfind('/')
            .map(|idx| &prefix[..idx])
            .filter(|dir| !dir.is_empty())
            .map(Path::from);
        let stream = match token {
            Some(token) => self
                .store
                .list_with_offset(prefix_path.as_ref(), &location(token)?),
            None => self.store.list(prefix_path.as_ref()),
        };
        let mut stream = stream.filter(|meta| {
            let keep = match meta {
                Ok(meta) => display_name(meta.location.as_ref()).starts_with(prefix),
                Err(_) => true,
            };
            futures::future::ready(keep)
        });

        let mut entries = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.context(ObjectStoreSnafu)?;
            entries.push(ObjectDescriptor::from_meta(meta));
            if self.page_size.is_some_and(|size| entries.len() >= size) {
                break;
            }
        }

        let full = self.page_size.is_some_and(|size| entries.len() >= size);
        let next_token = if full {
            entries.last().map(|e| e.name.clone())
        } else {
            None
        };
        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn fetch(&self, name: &str, range: Option<GetRange>) -> Result<FetchedBlob, StorageError> {
        let options = GetOptions {
            range,
            ..Default::default()
        };
        let result = self
            .store
            .get_opts(&location(name)?, options)
            .await
            .context(ObjectStoreSnafu)?;
        let descriptor = ObjectDescriptor::from_meta(result.meta.clone());
        let bytes = result.bytes().await.context(ObjectStoreSnafu)?;
        Ok(FetchedBlob { bytes, descriptor })
    }
}

#[async_trait]
impl BlobClient for ObjectStoreBlobClient {
    fn container(&self) -> &str {
        &self.container
    }

    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<ListPage, StorageError> {
        emit!(ListPageFetched);
        match tokio::time::timeout(timeout, self.collect_page(prefix, token)).await {
            Ok(page) => page,
            Err(_) => TimeoutSnafu {
                operation: "list",
                secs: timeout.as_secs(),
            }
            .fail(),
        }
    }

    async fn get_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<FetchedBlob, StorageError> {
        ensure!(start < end, InvalidRangeSnafu { name, start, end });
        self.fetch(name, Some(GetRange::Bounded(start..end))).await
    }

    async fn get(&self, name: &str) -> Result<FetchedBlob, StorageError> {
        self.fetch(name, None).await
    }

    async fn create_marker(&self, name: &str) -> Result<(), StorageError> {
        let path = location(name)?;
        let options = PutOptions::from(PutMode::Create);
        match self
            .store
            .put_opts(&path, PutPayload::from(Bytes::new()), options)
            .await
        {
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(()),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    async fn acquire_lease(
        &self,
        name: &str,
        duration: Duration,
        timeout: Duration,
        owner: &str,
    ) -> Result<bool, StorageError> {
        let path = location(name)?;
        let attempt = lease::acquire(self.store.as_ref(), &path, duration, owner);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(acquired) => acquired,
            Err(_) => TimeoutSnafu {
                operation: "lease",
                secs: timeout.as_secs(),
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_config(url: Option<&str>) -> StorageConfig {
        StorageConfig {
            account: "acct".to_string(),
            access_key: None,
            container: "logs".to_string(),
            endpoint: "core.windows.net".to_string(),
            url: url.map(String::from),
        }
    }

    async fn client_with(names: &[&str], page_size: Option<usize>) -> ObjectStoreBlobClient {
        let store = Arc::new(InMemory::new());
        for name in names {
            store
                .put(&Path::from(*name), PutPayload::from_static(b"{}\n"))
                .await
                .unwrap();
        }
        ObjectStoreBlobClient::new(store, "logs", page_size)
    }

    #[test]
    fn test_backend_resolution() {
        let azure = BackendConfig::from_storage_config(&storage_config(None)).unwrap();
        assert!(matches!(azure, BackendConfig::Azure(ref c) if c.container == "logs"));

        let local = BackendConfig::from_storage_config(&storage_config(Some("file:///tmp/blobs")))
            .unwrap();
        assert_eq!(
            local,
            BackendConfig::Local(LocalConfig {
                path: "/tmp/blobs".to_string()
            })
        );

        let memory = BackendConfig::from_storage_config(&storage_config(Some("memory://"))).unwrap();
        assert_eq!(memory, BackendConfig::Memory);

        let url = "https://other.blob.core.windows.net/sincedb";
        match BackendConfig::parse_url(url, &storage_config(None)).unwrap() {
            BackendConfig::Azure(c) => {
                assert_eq!(c.account, "other");
                assert_eq!(c.container, "sincedb");
            }
            other => panic!("expected azure backend, got {other:?}"),
        }

        assert!(BackendConfig::parse_url("ftp://nope", &storage_config(None)).is_err());
    }

    #[tokio::test]
    async fn test_pages_chain_through_tokens() {
        let client = client_with(&["a.log", "b.log", "c.log", "d.log", "e.log"], Some(2)).await;
        let timeout = Duration::from_secs(5);

        let first = client.list_page("", None, timeout).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("b.log"));

        let second = client.list_page("", first.next_token.as_deref(), timeout).await.unwrap();
        assert_eq!(second.entries[0].name, "c.log");

        let last = client.list_page("", Some("d.log"), timeout).await.unwrap();
        assert_eq!(last.entries.len(), 1);
        assert!(last.next_token.is_none());
    }

    #[tokio::test]
    async fn test_prefix_is_textual() {
        let client = client_with(&["logs/app/1.log", "logs/application/2.log"], None).await;
        let page = client
            .list_page("logs/app/", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].name, "logs/app/1.log");

        let page = client
            .list_page("logs/app", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_range_read_is_end_exclusive() {
        let store = Arc::new(InMemory::new());
        store
            .put(&Path::from("a.log"), PutPayload::from_static(b"0123456789"))
            .await
            .unwrap();
        let client = ObjectStoreBlobClient::new(store, "logs", None);

        let fetched = client.get_range("a.log", 2, 5).await.unwrap();
        assert_eq!(&fetched.bytes[..], b"234");
        assert_eq!(fetched.descriptor.content_length, 10);

        assert!(client.get_range("a.log", 5, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_create_marker_is_idempotent() {
        let client = client_with(&[], None).await;
        client.create_marker("a.log.lock").await.unwrap();
        client.create_marker("a.log.lock").await.unwrap();
        let fetched = client.get("a.log.lock").await.unwrap();
        assert!(fetched.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_encoded_names_round_trip_through_every_call() {
        let client = client_with(&["logs/a#1.log", "logs/z.log"], Some(1)).await;
        let timeout = Duration::from_secs(5);

        let first = client.list_page("logs/", None, timeout).await.unwrap();
        let name = first.entries[0].name.clone();
        assert_eq!(display_name(&name), "logs/a#1.log");

        let fetched = client.get_range(&name, 0, 3).await.unwrap();
        assert_eq!(&fetched.bytes[..], b"{}\n");
        assert_eq!(fetched.descriptor.name, name);

        let next = client
            .list_page("logs/", first.next_token.as_deref(), timeout)
            .await
            .unwrap();
        assert_eq!(next.entries[0].name, "logs/z.log");

        let marker = format!("{name}.lock");
        client.create_marker(&marker).await.unwrap();
        assert!(
            client
                .acquire_lease(&marker, Duration::from_secs(30), timeout, "me")
                .await
                .unwrap()
        );
        assert_eq!(client.get(&name).await.unwrap().bytes.len(), 3);
    }

    #[test]
    fn test_display_name_decodes_each_segment() {
        assert_eq!(display_name("logs/a%231.log"), "logs/a#1.log");
        assert_eq!(display_name("plain/name.log"), "plain/name.log");
    }
}
