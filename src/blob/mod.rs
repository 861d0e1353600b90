//! Durable key → bytes storage.
//!
//! The [`BlobStore`] trait is the only way the monitor touches persistent
//! state. Keys are `/`-separated paths such as
//! `snapshots/<doc_id>/<timestamp>/content.txt`.
//!
//! | Backend | Type | Use |
//! |---------|------|-----|
//! | `memory` | [`MemoryBlobStore`] | tests, throwaway runs |
//! | `filesystem` | [`FsBlobStore`] | local deployments |
//! | `s3` | [`S3BlobStore`] | S3 and S3-compatible services |

pub mod fs;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::{MonitorError, Result};

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a key. A missing key is `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a key, replacing any previous value.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// All keys starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Open the backend named by `[storage].backend`.
pub fn open_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryBlobStore::new())),
        "filesystem" => Ok(Arc::new(FsBlobStore::new(&config.root))),
        "s3" => Ok(Arc::new(S3BlobStore::from_config(config)?)),
        other => Err(MonitorError::Config(format!(
            "unknown storage backend: '{}'",
            other
        ))),
    }
}

/// Keys are relative, `/`-separated and never contain `.` or `..` segments.
pub(crate) fn check_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(MonitorError::InvalidInput(format!(
            "invalid storage key: '{}'",
            key
        )));
    }
    Ok(())
}
