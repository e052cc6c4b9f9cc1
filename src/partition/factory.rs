//! Partition Factory
//!
//! Creates the writer for a partition key, seeded with whatever the store
//! already holds for that key so earlier data survives eviction and restarts.

use super::append::AppendStrategy;
use super::writer::{PartitionHandle, PartitionWriter, WriterOptions};
use crate::clock::Clock;
use crate::compression::Compression;
use crate::config::ArchiverConfig;
use crate::observer::{ArchiverObserver, Signal};
use crate::store::ObjectStore;
use bytes::BytesMut;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

pub struct PartitionFactory {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    compression: Compression,
    flush_interval: Duration,
    retry_backoff: Duration,
    queue_capacity: usize,
    append: AppendStrategy,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ArchiverObserver>,
}

impl PartitionFactory {
    pub fn new(
        config: &ArchiverConfig,
        store: Arc<dyn ObjectStore>,
        append: AppendStrategy,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn ArchiverObserver>,
    ) -> Self {
        PartitionFactory {
            store,
            key_prefix: config.key_prefix.clone(),
            compression: config.compression,
            flush_interval: config.flush_interval,
            retry_backoff: config.flush_retry_backoff,
            queue_capacity: config.partition_queue_capacity,
            append,
            clock,
            observer,
        }
    }

    /// Storage address for a partition key (prefix is prepended verbatim)
    pub fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Seed and start a partition. Never fails: a partition whose prior state
    /// cannot be loaded starts empty and the problem is signalled.
    pub async fn create(&self, key: &str) -> PartitionHandle {
        let object_key = self.object_key(key);
        let seed = self.fetch_seed(key, &object_key).await;
        let seeded_bytes = seed.len();

        let options = WriterOptions {
            key: key.to_string(),
            object_key,
            compression: self.compression,
            flush_interval: self.flush_interval,
            retry_backoff: self.retry_backoff,
            queue_capacity: self.queue_capacity,
            append: self.append.clone(),
        };
        let handle = PartitionWriter::spawn(
            options,
            seed,
            self.store.clone(),
            self.observer.clone(),
            self.clock.clone(),
        );

        self.observer.observe(Signal::PartitionCreated {
            key: key.to_string(),
            seeded_bytes,
        });
        handle
    }

    async fn fetch_seed(&self, key: &str, object_key: &str) -> BytesMut {
        let data = match self.store.get(object_key).await {
            Ok(data) => data,
            Err(e) => {
                self.observer.observe(Signal::SeedFetchFailed {
                    key: key.to_string(),
                    error: e.to_string(),
                    not_found: e.kind() == ErrorKind::NotFound,
                });
                return BytesMut::new();
            }
        };

        match self.compression.decompress(&data) {
            Ok(raw) => BytesMut::from(&raw[..]),
            Err(e) => {
                // The next flush overwrites the undecodable object
                self.observer.observe(Signal::SeedFetchFailed {
                    key: key.to_string(),
                    error: format!("could not decode {} object: {}", self.compression, e),
                    not_found: false,
                });
                BytesMut::new()
            }
        }
    }
}

impl std::fmt::Debug for PartitionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionFactory")
            .field("key_prefix", &self.key_prefix)
            .field("compression", &self.compression)
            .field("flush_interval", &self.flush_interval)
            .field("append", &self.append)
            .finish()
    }
}
