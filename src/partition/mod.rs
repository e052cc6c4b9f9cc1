//! Partitions
//!
//! A partition owns the buffer for one partition key. Its writer task applies
//! events in arrival order, persists the whole buffer on a timer and on close,
//! and is seeded from the store when created.

pub mod append;
pub mod factory;
pub mod writer;

pub use append::{AppendStrategy, DedupePredicate};
pub use factory::PartitionFactory;
pub use writer::{PartitionHandle, PartitionMessage, PartitionWriter, WriterOptions, FLUSH_ATTEMPTS_MAX};
