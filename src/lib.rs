//! Partitioned event archiver
//!
//! Events are routed by a caller-supplied key function to per-key partitions.
//! Each partition buffers its events, optionally dropping duplicate lines, and
//! periodically persists the whole buffer (optionally gzip-compressed) to an
//! object store under `prefix + key`. Idle partitions are flushed and evicted;
//! a partition created again for the same key is seeded from its stored object.

pub mod archive;
pub mod clock;
pub mod compression;
pub mod config;
pub mod error;
pub mod observer;
pub mod partition;
pub mod router;
pub mod store;

pub use archive::{Archive, NoopArchive};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use compression::Compression;
pub use config::{ArchiverConfig, StoreConfig, StoreType};
pub use error::{CloseError, ConfigError, FlushAllError, FlushError, LogError, PartitionKeyError};
pub use observer::{ArchiverObserver, ChannelObserver, Signal, TracingObserver};
pub use partition::{AppendStrategy, PartitionHandle};
pub use router::{PartitionKeyFn, Router, RouterBuilder, RouterStats};
pub use store::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore};
