//! Archiver Configuration
//!
//! Loaded from TOML, optionally overridden from `ARCHIVER_*` environment
//! variables, then validated before the router starts.
//!
//! | Variable | Field |
//! |----------|-------|
//! | ARCHIVER_PARTITION_TIMEOUT_MS | partition_timeout |
//! | ARCHIVER_FLUSH_INTERVAL_MS | flush_interval (0 disables) |
//! | ARCHIVER_EVENT_QUEUE_CAPACITY | event_queue_capacity |
//! | ARCHIVER_COMPRESSION | compression (none, gzip) |
//! | ARCHIVER_KEY_PREFIX | key_prefix |
//! | ARCHIVER_STORE | store.store_type (memory, localfs, s3) |
//! | ARCHIVER_DATA_PATH | store.local_path |
//! | ARCHIVER_S3_BUCKET | store.s3.bucket |
//! | ARCHIVER_S3_REGION | store.s3.region |
//! | ARCHIVER_S3_ENDPOINT | store.s3.endpoint |

use crate::compression::Compression;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main archiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    /// Idle duration after which a partition is flushed and evicted
    #[serde(with = "duration_millis")]
    pub partition_timeout: Duration,
    /// Capacity of the router's inbound event queue
    pub event_queue_capacity: usize,
    /// Capacity of each partition's inbound queue
    pub partition_queue_capacity: usize,
    /// Periodic flush interval; zero disables periodic flushing
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Pause between persist attempts (default: none)
    #[serde(with = "duration_millis")]
    pub flush_retry_backoff: Duration,
    /// Compression applied to persisted objects
    pub compression: Compression,
    /// Prepended verbatim to every partition key to form the object key
    pub key_prefix: String,
    /// Backing store settings
    pub store: StoreConfig,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        ArchiverConfig {
            partition_timeout: Duration::from_secs(60),
            event_queue_capacity: 10_000,
            partition_queue_capacity: 1_024,
            flush_interval: Duration::from_secs(30),
            flush_retry_backoff: Duration::ZERO,
            compression: Compression::Gzip,
            key_prefix: String::new(),
            store: StoreConfig::default(),
        }
    }
}

impl ArchiverConfig {
    /// Configuration for tests (in-memory, no compression, no periodic flush)
    pub fn test() -> Self {
        ArchiverConfig {
            partition_timeout: Duration::from_secs(60),
            event_queue_capacity: 64,
            partition_queue_capacity: 16,
            flush_interval: Duration::ZERO,
            flush_retry_backoff: Duration::ZERO,
            compression: Compression::None,
            key_prefix: "test/".to_string(),
            store: StoreConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Override fields from `ARCHIVER_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("ARCHIVER_PARTITION_TIMEOUT_MS") {
            self.partition_timeout = Duration::from_millis(parse_u64("partition_timeout", &v)?);
        }
        if let Some(v) = var("ARCHIVER_FLUSH_INTERVAL_MS") {
            self.flush_interval = Duration::from_millis(parse_u64("flush_interval", &v)?);
        }
        if let Some(v) = var("ARCHIVER_EVENT_QUEUE_CAPACITY") {
            self.event_queue_capacity = parse_u64("event_queue_capacity", &v)? as usize;
        }
        if let Some(v) = var("ARCHIVER_COMPRESSION") {
            self.compression = v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "compression",
                value: v.clone(),
            })?;
        }
        if let Some(v) = var("ARCHIVER_KEY_PREFIX") {
            self.key_prefix = v;
        }
        if let Some(v) = var("ARCHIVER_STORE") {
            self.store.store_type = v.parse()?;
        }
        if let Some(v) = var("ARCHIVER_DATA_PATH") {
            self.store.local_path = Some(PathBuf::from(v));
        }
        #[cfg(feature = "s3")]
        {
            if let Some(bucket) = var("ARCHIVER_S3_BUCKET") {
                let s3 = self.store.s3.get_or_insert_with(S3Config::default);
                s3.bucket = bucket;
            }
            if let Some(region) = var("ARCHIVER_S3_REGION") {
                let s3 = self.store.s3.get_or_insert_with(S3Config::default);
                s3.region = region;
            }
            if let Some(endpoint) = var("ARCHIVER_S3_ENDPOINT") {
                let s3 = self.store.s3.get_or_insert_with(S3Config::default);
                s3.endpoint = Some(endpoint);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_timeout.is_zero() {
            return Err(ConfigError::ZeroPartitionTimeout);
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity("event_queue_capacity"));
        }
        if self.partition_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity("partition_queue_capacity"));
        }
        self.store.validate()
    }

    /// Period of the idle sweep: half the partition timeout
    pub fn sweep_interval(&self) -> Duration {
        (self.partition_timeout / 2).max(Duration::from_millis(1))
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// Type of backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// In-memory store (for tests)
    #[default]
    Memory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    #[cfg(feature = "s3")]
    S3,
}

impl std::str::FromStr for StoreType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreType::Memory),
            "localfs" => Ok(StoreType::LocalFs),
            #[cfg(feature = "s3")]
            "s3" => Ok(StoreType::S3),
            _ => Err(ConfigError::InvalidValue {
                field: "store_type",
                value: s.to_string(),
            }),
        }
    }
}

/// Backing store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_type: StoreType,
    /// Base directory (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    #[cfg(feature = "s3")]
    pub s3: Option<S3Config>,
}

impl StoreConfig {
    pub fn local(path: PathBuf) -> Self {
        StoreConfig {
            store_type: StoreType::LocalFs,
            local_path: Some(path),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.store_type {
            StoreType::Memory => Ok(()),
            StoreType::LocalFs if self.local_path.is_none() => {
                Err(ConfigError::MissingStoreField("local_path"))
            }
            StoreType::LocalFs => Ok(()),
            #[cfg(feature = "s3")]
            StoreType::S3 => match &self.s3 {
                Some(s3) if !s3.bucket.is_empty() => Ok(()),
                _ => Err(ConfigError::MissingStoreField("s3.bucket")),
            },
        }
    }
}

/// S3 configuration
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

#[cfg(feature = "s3")]
impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
