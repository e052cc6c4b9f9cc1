//! Observability signals
//!
//! Lifecycle and persistence problems never reach the caller of `log`; they
//! are delivered here. `TracingObserver` is the default; `ChannelObserver`
//! forwards signals to a receiver owned by the application.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Something an operator may want to know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A new partition started (after its seed fetch)
    PartitionCreated { key: String, seeded_bytes: usize },
    /// A partition was idle for at least the timeout and has been flushed and removed
    PartitionEvicted { key: String, idle: Duration },
    /// A partition failed its final flush; its unpersisted bytes are lost
    PartitionCloseFailed { key: String, error: String },
    /// A periodic or explicit flush failed; the buffer is kept for the next attempt
    FlushFailed { key: String, error: String },
    /// Prior state for a new partition could not be loaded; it starts empty
    SeedFetchFailed {
        key: String,
        error: String,
        not_found: bool,
    },
    /// No partition key could be derived; the event was dropped
    EventSkipped { error: String },
}

/// Receiver of observability signals. Called from archiver tasks; must not block.
pub trait ArchiverObserver: Send + Sync + 'static {
    fn observe(&self, signal: Signal);
}

/// Logs every signal through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ArchiverObserver for TracingObserver {
    fn observe(&self, signal: Signal) {
        match signal {
            Signal::PartitionCreated { key, seeded_bytes } => {
                info!(partition = %key, seeded_bytes, "Partition created");
            }
            Signal::PartitionEvicted { key, idle } => {
                info!(partition = %key, idle_ms = idle.as_millis() as u64, "Partition evicted");
            }
            Signal::PartitionCloseFailed { key, error } => {
                error!(partition = %key, %error, "Could not close partition (possible data loss)");
            }
            Signal::FlushFailed { key, error } => {
                error!(partition = %key, %error, "Flush failed, buffer retained");
            }
            Signal::SeedFetchFailed {
                key,
                error,
                not_found: true,
            } => {
                debug!(partition = %key, %error, "No prior state for partition");
            }
            Signal::SeedFetchFailed { key, error, .. } => {
                warn!(partition = %key, %error, "Could not load prior state, starting empty");
            }
            Signal::EventSkipped { error } => {
                warn!(%error, "Could not derive partition key, event skipped");
            }
        }
    }
}

/// Forwards signals into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Signal>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelObserver { tx }, rx)
    }
}

impl ArchiverObserver for ChannelObserver {
    fn observe(&self, signal: Signal) {
        // Receiver dropped: the application stopped listening
        let _ = self.tx.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_observer_forwards_in_order() {
        let (observer, mut rx) = ChannelObserver::new();

        observer.observe(Signal::EventSkipped {
            error: "bad".to_string(),
        });
        observer.observe(Signal::PartitionCreated {
            key: "a".to_string(),
            seeded_bytes: 0,
        });

        assert_eq!(
            rx.recv().await,
            Some(Signal::EventSkipped {
                error: "bad".to_string()
            })
        );
        assert!(matches!(rx.recv().await, Some(Signal::PartitionCreated { .. })));
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.observe(Signal::EventSkipped {
            error: "ignored".to_string(),
        });
    }

    #[test]
    fn test_tracing_observer_handles_every_signal() {
        let observer = TracingObserver;
        observer.observe(Signal::PartitionEvicted {
            key: "a".to_string(),
            idle: Duration::from_secs(61),
        });
        observer.observe(Signal::SeedFetchFailed {
            key: "a".to_string(),
            error: "missing".to_string(),
            not_found: true,
        });
        observer.observe(Signal::PartitionCloseFailed {
            key: "a".to_string(),
            error: "boom".to_string(),
        });
    }
}
