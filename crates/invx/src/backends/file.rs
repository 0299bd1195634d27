//! 📁 File blob store: `<root>/<key>` on local disk.
//!
//! For replaying a captured event against a directory of snapshot files that mirrors
//! the bucket layout. The bucket name is ignored; the root stands in for it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::trace;

use crate::backends::{BlobStore, FetchError};
use crate::common::StorageWriteRecord;

#[derive(Debug, Deserialize, Clone)]
pub struct FileBlobStoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(config: &FileBlobStoreConfig) -> Result<Self> {
        if !config.root.is_dir() {
            anyhow::bail!(
                "💀 Blob store root '{}' is not a directory. We looked. It's not there. Or it's a file pretending.",
                config.root.display()
            );
        }
        let root = config
            .root
            .canonicalize()
            .with_context(|| format!("💀 Could not resolve blob store root '{}'", config.root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let relative = std::path::Path::new(key);
        // keys must stay under the root
        if relative.is_absolute()
            || relative
                .components()
                .any(|part| matches!(part, std::path::Component::ParentDir))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn fetch_object(&self, record: &StorageWriteRecord) -> Result<String, FetchError> {
        let Some(path) = self.path_for(&record.key) else {
            return Err(FetchError::access_denied(record));
        };
        trace!("📥 Reading {}", path.display());
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => FetchError::not_found(record),
                ErrorKind::PermissionDenied => FetchError::access_denied(record),
                ErrorKind::InvalidData => FetchError::unreadable(record, err.to_string()),
                _ => FetchError::transport(record, err),
            })
    }
}
