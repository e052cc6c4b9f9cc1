//! Error types
//!
//! Only configuration problems and caller-side queue conditions reach the
//! caller synchronously. Persistence failures are returned from `flush`/`close`
//! and reported through the observer.

use bytes::Bytes;
use std::io::Error as IoError;

/// Error produced by a partition key function
pub type PartitionKeyError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid or unreadable configuration, returned before any task starts
#[derive(Debug)]
pub enum ConfigError {
    /// Partition idle timeout must be non-zero
    ZeroPartitionTimeout,
    /// A queue capacity was zero
    ZeroQueueCapacity(&'static str),
    /// No partition key function supplied to the builder
    MissingPartitionKey,
    /// Store type needs a field that is absent
    MissingStoreField(&'static str),
    /// A value could not be interpreted
    InvalidValue { field: &'static str, value: String },
    /// Config file could not be parsed
    Parse(String),
    /// Config file could not be read
    Io(IoError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroPartitionTimeout => write!(f, "partition_timeout must not be zero"),
            ConfigError::ZeroQueueCapacity(field) => write!(f, "{} must be greater than zero", field),
            ConfigError::MissingPartitionKey => write!(f, "A partition key function is required"),
            ConfigError::MissingStoreField(field) => {
                write!(f, "Store configuration requires {}", field)
            }
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value for {}: {:?}", field, value)
            }
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ConfigError {
    fn from(e: IoError) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// A partition's buffer could not be persisted
#[derive(Debug)]
pub enum FlushError {
    /// Buffer could not be compressed
    Compress { key: String, source: IoError },
    /// Every put attempt failed; carries the last error
    Persist {
        key: String,
        attempts: u32,
        source: IoError,
    },
    /// The partition's writer task ended without replying
    WriterGone { key: String },
}

impl FlushError {
    /// Storage key of the partition that failed
    pub fn key(&self) -> &str {
        match self {
            FlushError::Compress { key, .. }
            | FlushError::Persist { key, .. }
            | FlushError::WriterGone { key } => key,
        }
    }
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushError::Compress { key, source } => {
                write!(f, "Failed to compress buffer for {}: {}", key, source)
            }
            FlushError::Persist {
                key,
                attempts,
                source,
            } => write!(
                f,
                "Failed to persist {} after {} attempts: {}",
                key, attempts, source
            ),
            FlushError::WriterGone { key } => write!(f, "Writer for {} is no longer running", key),
        }
    }
}

impl std::error::Error for FlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlushError::Compress { source, .. } | FlushError::Persist { source, .. } => Some(source),
            FlushError::WriterGone { .. } => None,
        }
    }
}

/// One or more partitions failed their final flush while the router closed
#[derive(Debug)]
pub struct CloseError {
    /// (partition key, error) for every partition that failed
    pub failures: Vec<(String, FlushError)>,
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} partition(s) failed to close (possible data loss):",
            self.failures.len()
        )?;
        for (key, err) in &self.failures {
            write!(f, " [{}: {}]", key, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

/// One or more partitions failed a router-wide flush; their buffers are kept
#[derive(Debug)]
pub struct FlushAllError {
    pub failures: Vec<(String, FlushError)>,
}

impl std::fmt::Display for FlushAllError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} partition(s) failed to flush:", self.failures.len())?;
        for (key, err) in &self.failures {
            write!(f, " [{}: {}]", key, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for FlushAllError {}

/// An event was not accepted; the event is handed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Inbound queue is full (non-blocking submission only)
    Full(Bytes),
    /// Router has been closed
    Closed(Bytes),
}

impl LogError {
    pub fn into_event(self) -> Bytes {
        match self {
            LogError::Full(event) | LogError::Closed(event) => event,
        }
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Full(_) => write!(f, "Event queue is full"),
            LogError::Closed(_) => write!(f, "Archiver is closed"),
        }
    }
}

impl std::error::Error for LogError {}
