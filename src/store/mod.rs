//! Backing Store Abstraction
//!
//! Partitions persist their whole buffer under a single object key and read it
//! back when a partition for the same key is created again. The store only has
//! to provide whole-object overwrite and fetch.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests and local runs
//! - `LocalFsObjectStore`: For development
//! - `SimulatedObjectStore`: Fault-injecting wrapper for tests
//! - `S3ObjectStore`: For production (feature-gated)

pub mod simulated;
#[cfg(feature = "s3")]
pub mod s3;

use crate::config::{StoreConfig, StoreType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

pub use simulated::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/// Boxed future returned by store operations
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Object store abstraction trait
///
/// `get` reports a missing object as `ErrorKind::NotFound`.
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;
}

/// Build the store described by `config`.
pub async fn open(config: &StoreConfig) -> IoResult<Arc<dyn ObjectStore>> {
    match config.store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryObjectStore::new())),
        StoreType::LocalFs => {
            let path = config.local_path.clone().ok_or_else(|| {
                IoError::new(ErrorKind::InvalidInput, "local_path required for localfs store")
            })?;
            tokio::fs::create_dir_all(&path).await?;
            Ok(Arc::new(LocalFsObjectStore::new(path)))
        }
        #[cfg(feature = "s3")]
        StoreType::S3 => {
            let s3 = config.s3.clone().ok_or_else(|| {
                IoError::new(ErrorKind::InvalidInput, "s3 section required for s3 store")
            })?;
            Ok(Arc::new(S3ObjectStore::new(s3).await?))
        }
    }
}

// ============================================================================
// InMemoryObjectStore
// ============================================================================

/// In-memory object store for unit tests and local runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Stored keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().insert(key.to_string(), data.to_vec());
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }
}

// ============================================================================
// LocalFsObjectStore
// ============================================================================

/// Local filesystem object store. Keys map to paths under `base_path`.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore { base_path }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Readers never observe a half-written object
            let mut tmp = path.clone().into_os_string();
            tmp.push(".partial");
            let tmp = PathBuf::from(tmp);
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, &path).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store.put("events/a", b"hello world").await.unwrap();
        let data = store.get("events/a").await.unwrap();

        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_inmemory_get_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_inmemory_put_overwrites() {
        let store = InMemoryObjectStore::new();

        store.put("k", b"first").await.unwrap();
        store.put("k", b"second").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), b"second");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_localfs_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        store.put("events/2024/a.log", b"hello world").await.unwrap();
        let data = store.get("events/2024/a.log").await.unwrap();

        assert_eq!(data, b"hello world");
        assert!(dir.path().join("events/2024/a.log").is_file());
        assert!(!dir.path().join("events/2024/a.log.partial").exists());
    }

    #[tokio::test]
    async fn test_localfs_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        assert_eq!(store.get("missing").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open(&StoreConfig::default()).await.unwrap();
        store.put("k", b"v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_open_localfs_requires_path() {
        let config = StoreConfig {
            store_type: StoreType::LocalFs,
            ..StoreConfig::default()
        };
        let err = open(&config).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
