//! Partition Writer - one actor per partition key
//!
//! The writer task is the only owner of its partition's buffer. Everything
//! else talks to it through a `PartitionHandle`.
//!
//! ```text
//! Router ──Event──┐
//! close() ─Shutdown┤──► PartitionWriter ──► append ──► (timer) compress + put
//! flush() ─Flush──┘
//! ```
//!
//! Shutdown closes the queue first, then drains whatever is still queued, then
//! performs the final flush. Sends that lose the race against shutdown fail
//! and hand the event back to the sender.

use super::append::AppendStrategy;
use crate::clock::{Clock, Timestamp};
use crate::compression::Compression;
use crate::error::FlushError;
use crate::observer::{ArchiverObserver, Signal};
use crate::store::ObjectStore;
use bytes::{Bytes, BytesMut};
use std::io::Error as IoError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Persist attempts per flush before giving up
pub const FLUSH_ATTEMPTS_MAX: u32 = 10;

/// Messages for the partition writer
pub enum PartitionMessage {
    /// Append an event to the buffer
    Event(Bytes),
    /// Persist the buffer now
    Flush {
        response_tx: oneshot::Sender<Result<(), FlushError>>,
    },
    /// Copy of the current buffer
    Snapshot { response_tx: oneshot::Sender<Bytes> },
    /// Stop accepting events, drain, persist, exit
    Shutdown {
        response_tx: oneshot::Sender<Result<(), FlushError>>,
    },
}

/// Per-partition settings resolved by the factory
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Partition key
    pub key: String,
    /// Storage address: prefix + partition key
    pub object_key: String,
    pub compression: Compression,
    /// Zero disables the periodic flush
    pub flush_interval: Duration,
    pub retry_backoff: Duration,
    pub queue_capacity: usize,
    pub append: AppendStrategy,
}

pub struct PartitionWriter {
    options: WriterOptions,
    buffer: BytesMut,
    /// Buffer changed since the last successful persist
    dirty: bool,
    store: Arc<dyn ObjectStore>,
    observer: Arc<dyn ArchiverObserver>,
    rx: mpsc::Receiver<PartitionMessage>,
    /// Set once the final flush has finished
    stopped: watch::Sender<bool>,
}

impl PartitionWriter {
    /// Start a writer seeded with `seed` and return its handle
    pub fn spawn(
        options: WriterOptions,
        seed: BytesMut,
        store: Arc<dyn ObjectStore>,
        observer: Arc<dyn ArchiverObserver>,
        clock: Arc<dyn Clock>,
    ) -> PartitionHandle {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let handle = PartitionHandle {
            key: options.key.clone(),
            object_key: options.object_key.clone(),
            tx,
            stopped: stopped_rx,
            last_active: Arc::new(AtomicU64::new(clock.now().as_millis())),
            clock,
        };

        let writer = PartitionWriter {
            options,
            buffer: seed,
            dirty: false,
            store,
            observer,
            rx,
            stopped: stopped_tx,
        };
        tokio::spawn(writer.run());

        handle
    }

    /// Timer ticks persist only when the buffer changed since the last
    /// successful persist; explicit flushes and the final flush always do.
    async fn run(mut self) {
        let mut ticker = flush_ticker(self.options.flush_interval);

        loop {
            tokio::select! {
                _ = next_tick(&mut ticker) => {
                    if self.dirty {
                        if let Err(e) = self.flush().await {
                            self.observer.observe(Signal::FlushFailed {
                                key: self.options.key.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(PartitionMessage::Event(event)) => self.append(&event),
                    Some(PartitionMessage::Flush { response_tx }) => {
                        let result = self.flush().await;
                        let _ = response_tx.send(result);
                    }
                    Some(PartitionMessage::Snapshot { response_tx }) => {
                        let _ = response_tx.send(Bytes::copy_from_slice(&self.buffer));
                    }
                    Some(PartitionMessage::Shutdown { response_tx }) => {
                        self.shutdown(response_tx).await;
                        break;
                    }
                    None => {
                        // Every handle dropped without a close
                        if let Err(e) = self.flush().await {
                            self.observer.observe(Signal::PartitionCloseFailed {
                                key: self.options.key.clone(),
                                error: e.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        }

        self.stopped.send_replace(true);
        debug!(partition = %self.options.key, "Partition writer stopped");
    }

    fn append(&mut self, event: &[u8]) {
        if self.options.append.append(&mut self.buffer, event) {
            self.dirty = true;
        }
    }

    /// Close the queue, apply everything still queued, then persist once and
    /// answer every pending flush/close request with that result.
    async fn shutdown(&mut self, response_tx: oneshot::Sender<Result<(), FlushError>>) {
        self.rx.close();

        let mut waiters = Vec::new();
        let mut drained = 0usize;
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                PartitionMessage::Event(event) => {
                    self.append(&event);
                    drained += 1;
                }
                PartitionMessage::Flush { response_tx } | PartitionMessage::Shutdown { response_tx } => {
                    waiters.push(response_tx);
                }
                PartitionMessage::Snapshot { response_tx } => {
                    let _ = response_tx.send(Bytes::copy_from_slice(&self.buffer));
                }
            }
        }
        if drained > 0 {
            debug!(partition = %self.options.key, drained, "Drained queued events before final flush");
        }

        let result = self.flush().await;
        match &result {
            Ok(()) => info!(
                partition = %self.options.key,
                bytes = self.buffer.len(),
                "Partition closed"
            ),
            Err(e) => warn!(partition = %self.options.key, error = %e, "Final flush failed"),
        }
        self.stopped.send_replace(true);
        for tx in waiters {
            let _ = tx.send(result.as_ref().map(|_| ()).map_err(duplicate_error));
        }
        let _ = response_tx.send(result);
    }

    /// Compress the whole buffer and overwrite the partition's object,
    /// retrying up to `FLUSH_ATTEMPTS_MAX` times. The buffer is kept as is
    /// either way; the object always holds the complete partition.
    async fn flush(&mut self) -> Result<(), FlushError> {
        let payload = self
            .options
            .compression
            .compress(&self.buffer)
            .map_err(|source| FlushError::Compress {
                key: self.options.object_key.clone(),
                source,
            })?;

        let mut attempt = 1;
        loop {
            match self.store.put(&self.options.object_key, &payload).await {
                Ok(()) => {
                    self.dirty = false;
                    debug!(
                        partition = %self.options.key,
                        object = %self.options.object_key,
                        bytes = payload.len(),
                        attempt,
                        "Flushed partition"
                    );
                    return Ok(());
                }
                Err(source) if attempt >= FLUSH_ATTEMPTS_MAX => {
                    return Err(FlushError::Persist {
                        key: self.options.object_key.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        partition = %self.options.key,
                        attempt,
                        error = %e,
                        "Persist attempt failed, retrying"
                    );
                    attempt += 1;
                    if !self.options.retry_backoff.is_zero() {
                        tokio::time::sleep(self.options.retry_backoff).await;
                    }
                }
            }
        }
    }
}

fn flush_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    // Next flush is one full interval after the previous one finished
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn duplicate_error(e: &FlushError) -> FlushError {
    match e {
        FlushError::Compress { key, source } => FlushError::Compress {
            key: key.clone(),
            source: IoError::new(source.kind(), source.to_string()),
        },
        FlushError::Persist {
            key,
            attempts,
            source,
        } => FlushError::Persist {
            key: key.clone(),
            attempts: *attempts,
            source: IoError::new(source.kind(), source.to_string()),
        },
        FlushError::WriterGone { key } => FlushError::WriterGone { key: key.clone() },
    }
}

// ============================================================================
// PartitionHandle - public interface for interacting with a writer
// ============================================================================

/// Handle for sending messages to a partition writer
#[derive(Clone)]
pub struct PartitionHandle {
    key: String,
    object_key: String,
    tx: mpsc::Sender<PartitionMessage>,
    stopped: watch::Receiver<bool>,
    last_active: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl PartitionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    /// Last time an event was submitted (never decreases)
    pub fn last_active(&self) -> Timestamp {
        Timestamp::from_millis(self.last_active.load(Ordering::SeqCst))
    }

    /// True once the writer has stopped accepting events. The final flush
    /// may still be in progress; see `stopped`.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the writer has finished its final flush and exited.
    /// Nothing else writes this partition's object after this returns.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // Sender dropped means the task is gone
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Both handles talk to the same writer
    pub fn same_writer(&self, other: &PartitionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Queue an event, waiting for queue space. Activity is recorded at
    /// submission. If the writer has stopped accepting events the event is
    /// returned unapplied.
    pub async fn log(&self, event: Bytes) -> Result<(), Bytes> {
        self.last_active
            .fetch_max(self.clock.now().as_millis(), Ordering::SeqCst);
        self.tx
            .send(PartitionMessage::Event(event.clone()))
            .await
            .map_err(|_| event)
    }

    /// Persist the buffer now, after everything queued before this call
    pub async fn flush(&self) -> Result<(), FlushError> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(PartitionMessage::Flush { response_tx })
            .await
            .is_err()
        {
            return Err(self.writer_gone());
        }
        response_rx.await.unwrap_or_else(|_| Err(self.writer_gone()))
    }

    /// Stop the writer, waiting for the queued events and the final flush.
    /// Closing an already closed partition is a no-op.
    pub async fn close(&self) -> Result<(), FlushError> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(PartitionMessage::Shutdown { response_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        response_rx.await.unwrap_or_else(|_| Err(self.writer_gone()))
    }

    /// Current (uncompressed) buffer, or None if the writer has stopped
    pub async fn snapshot(&self) -> Option<Bytes> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PartitionMessage::Snapshot { response_tx })
            .await
            .ok()?;
        response_rx.await.ok()
    }

    fn writer_gone(&self) -> FlushError {
        FlushError::WriterGone {
            key: self.object_key.clone(),
        }
    }
}

impl std::fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("key", &self.key)
            .field("object_key", &self.object_key)
            .field("last_active", &self.last_active())
            .finish()
    }
}
