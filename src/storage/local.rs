//! Local filesystem backend, used for development runs.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::sync::Arc;

use crate::error::{IoSnafu, LocalConfigSnafu, StorageError};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl LocalConfig {
    pub(super) fn build(&self) -> Result<Arc<dyn ObjectStore>, StorageError> {
        std::fs::create_dir_all(&self.path).context(IoSnafu)?;
        let store = LocalFileSystem::new_with_prefix(&self.path).context(LocalConfigSnafu)?;
        Ok(Arc::new(store))
    }
}
