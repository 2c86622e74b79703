//! Azure Blob Storage backend.

use object_store::azure::MicrosoftAzureBuilder;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::sync::Arc;

use crate::config::DEFAULT_ENDPOINT;
use crate::error::{AzureConfigSnafu, StorageError};

/// Azure Blob Storage configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    pub access_key: Option<String>,
    pub container: String,
    /// Endpoint suffix, e.g. "core.windows.net".
    pub endpoint: String,
}

// Keeps the access key out of logs.
impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl AzureConfig {
    /// Blob service URL for this account.
    pub fn blob_host(&self) -> String {
        format!("https://{}.blob.{}", self.account, self.endpoint)
    }

    pub(super) fn build(&self) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(&self.account)
            .with_container_name(&self.container)
            .with_retry(RetryConfig::default());

        if let Some(key) = &self.access_key {
            builder = builder.with_access_key(key);
        }

        if self.endpoint != DEFAULT_ENDPOINT {
            builder = builder.with_endpoint(self.blob_host());
        }

        let store = builder.build().context(AzureConfigSnafu)?;
        Ok(Arc::new(store))
    }
}
