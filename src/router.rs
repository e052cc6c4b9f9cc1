//! Router - partition key routing, idle eviction and shutdown
//!
//! ```text
//! log() ──► inbound queue ──► dispatcher ──► key fn ──► table ──► PartitionHandle::log
//!                                                         ▲
//!                                     sweeper (every timeout/2) evicts idle partitions
//! ```
//!
//! The dispatcher is the only task that creates partitions. The table is a
//! `parking_lot::Mutex` that is never held across an await.
//!
//! ## Eviction race
//!
//! A partition chosen for eviction is replaced in the table by a `Draining`
//! marker before its close starts. Its writer drains what is already queued
//! and rejects later sends, handing the event back. The dispatcher re-routes a
//! rejected event; lookups that hit a `Draining` marker wait for the final
//! flush, so the replacement partition is seeded with everything the evicted
//! one persisted and two writers for a key never coexist.

use crate::clock::{Clock, SystemClock};
use crate::config::ArchiverConfig;
use crate::error::{CloseError, ConfigError, FlushAllError, LogError, PartitionKeyError};
use crate::observer::{ArchiverObserver, Signal, TracingObserver};
use crate::partition::{AppendStrategy, PartitionFactory, PartitionHandle};
use crate::store::{self, ObjectStore};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Derives the partition key of an event. Assumed pure: an event whose key
/// cannot be derived is dropped, never retried.
pub type PartitionKeyFn = Arc<dyn Fn(&[u8]) -> Result<String, PartitionKeyError> + Send + Sync>;

enum Inbound {
    Event(Bytes),
    /// Flush every partition once all earlier events have been forwarded
    Flush {
        response_tx: oneshot::Sender<Result<(), FlushAllError>>,
    },
}

enum Slot {
    Active(PartitionHandle),
    /// Final flush in progress; resolves to true once the entry is removed
    Draining(watch::Receiver<bool>),
}

/// What `acquire` waits on before it may create a partition
enum Pending {
    Stopping(PartitionHandle),
    Draining(watch::Receiver<bool>),
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_routed: AtomicU64,
    events_rerouted: AtomicU64,
    events_skipped: AtomicU64,
    events_dropped: AtomicU64,
    partitions_created: AtomicU64,
    partitions_evicted: AtomicU64,
    close_failures: AtomicU64,
}

/// Point-in-time router counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Accepted into the inbound queue
    pub events_received: u64,
    /// Forwarded to a partition
    pub events_routed: u64,
    /// Handed back by a closing partition and routed again
    pub events_rerouted: u64,
    /// No partition key could be derived
    pub events_skipped: u64,
    /// Rejected by `try_log` because the inbound queue was full
    pub events_dropped: u64,
    pub partitions_created: u64,
    pub partitions_evicted: u64,
    /// Partitions whose final flush failed (eviction or close)
    pub close_failures: u64,
    pub live_partitions: usize,
}

struct Shared {
    table: Mutex<HashMap<String, Slot>>,
    factory: PartitionFactory,
    partition_key: PartitionKeyFn,
    partition_timeout: Duration,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ArchiverObserver>,
    counters: Counters,
}

impl Shared {
    async fn route(&self, event: Bytes) {
        let key = match (self.partition_key)(&event) {
            Ok(key) => key,
            Err(e) => {
                self.counters.events_skipped.fetch_add(1, Ordering::Relaxed);
                self.observer.observe(Signal::EventSkipped {
                    error: e.to_string(),
                });
                return;
            }
        };

        let mut event = event;
        loop {
            let handle = self.acquire(&key).await;
            match handle.log(event).await {
                Ok(()) => {
                    self.counters.events_routed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(rejected) => {
                    debug!(partition = %key, "Partition stopped accepting events, re-routing");
                    self.counters.events_rerouted.fetch_add(1, Ordering::Relaxed);
                    event = rejected;
                }
            }
        }
    }

    /// Live handle for `key`, creating the partition if needed
    async fn acquire(&self, key: &str) -> PartitionHandle {
        loop {
            let pending = {
                let table = self.table.lock();
                match table.get(key) {
                    Some(Slot::Active(handle)) if !handle.is_closed() => return handle.clone(),
                    Some(Slot::Active(handle)) => Pending::Stopping(handle.clone()),
                    Some(Slot::Draining(done)) => Pending::Draining(done.clone()),
                    None => break,
                }
            };

            match pending {
                Pending::Stopping(closed) => {
                    // Closed directly through its handle; its final flush
                    // must land before a replacement seeds from the store
                    closed.stopped().await;
                    let mut table = self.table.lock();
                    if matches!(table.get(key), Some(Slot::Active(h)) if h.same_writer(&closed)) {
                        table.remove(key);
                    }
                }
                Pending::Draining(mut done) => {
                    if done.wait_for(|removed| *removed).await.is_err() {
                        // Evicting task went away without clearing its marker
                        let mut table = self.table.lock();
                        if matches!(table.get(key), Some(Slot::Draining(_))) {
                            table.remove(key);
                        }
                    }
                }
            }
        }

        let handle = self.factory.create(key).await;
        self.table
            .lock()
            .insert(key.to_string(), Slot::Active(handle.clone()));
        self.counters
            .partitions_created
            .fetch_add(1, Ordering::Relaxed);
        handle
    }

    fn active_handles(&self) -> Vec<(String, PartitionHandle)> {
        self.table
            .lock()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Active(handle) => Some((key.clone(), handle.clone())),
                Slot::Draining(_) => None,
            })
            .collect()
    }

    async fn flush_all(&self) -> Result<(), FlushAllError> {
        let flushes = self
            .active_handles()
            .into_iter()
            .map(|(key, handle)| async move { (key, handle.flush().await) });

        let failures: Vec<_> = join_all(flushes)
            .await
            .into_iter()
            .filter_map(|(key, result)| result.err().map(|e| (key, e)))
            .collect();

        for (key, e) in &failures {
            self.observer.observe(Signal::FlushFailed {
                key: key.clone(),
                error: e.to_string(),
            });
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlushAllError { failures })
        }
    }

    async fn sweep_idle(&self) -> usize {
        let idle = {
            let mut table = self.table.lock();
            let mut idle = Vec::new();
            for (key, slot) in table.iter_mut() {
                let handle = match slot {
                    Slot::Active(handle) => handle.clone(),
                    Slot::Draining(_) => continue,
                };
                if !self
                    .clock
                    .has_elapsed(handle.last_active(), self.partition_timeout)
                {
                    continue;
                }
                let idle_for = self.clock.elapsed(handle.last_active());
                let (done_tx, done_rx) = watch::channel(false);
                *slot = Slot::Draining(done_rx);
                idle.push((key.clone(), handle, idle_for, done_tx));
            }
            idle
        };

        if idle.is_empty() {
            return 0;
        }
        debug!(count = idle.len(), "Evicting idle partitions");

        let evictions = idle
            .into_iter()
            .map(|(key, handle, idle_for, done_tx)| async move {
                let result = handle.close().await;
                self.table.lock().remove(&key);
                let _ = done_tx.send(true);

                match result {
                    Ok(()) => {
                        self.counters
                            .partitions_evicted
                            .fetch_add(1, Ordering::Relaxed);
                        self.observer.observe(Signal::PartitionEvicted {
                            key,
                            idle: idle_for,
                        });
                    }
                    Err(e) => {
                        self.counters.close_failures.fetch_add(1, Ordering::Relaxed);
                        self.observer.observe(Signal::PartitionCloseFailed {
                            key,
                            error: e.to_string(),
                        });
                    }
                }
            });

        join_all(evictions).await.len()
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => handle_inbound(&shared, msg).await,
                None => break,
            }
        }
    }

    // Stop intake, then route everything already accepted
    rx.close();
    let mut drained = 0usize;
    while let Ok(msg) = rx.try_recv() {
        handle_inbound(&shared, msg).await;
        drained += 1;
    }
    debug!(drained, "Dispatcher stopped");
}

async fn handle_inbound(shared: &Arc<Shared>, msg: Inbound) {
    match msg {
        Inbound::Event(event) => shared.route(event).await,
        Inbound::Flush { response_tx } => {
            // Partition flushes are queued behind the events already forwarded
            let shared = shared.clone();
            tokio::spawn(async move {
                let _ = response_tx.send(shared.flush_all().await);
            });
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.sweep_idle().await;
            }
        }
    }
}

// ============================================================================
// RouterBuilder
// ============================================================================

/// Builder for `Router`. A partition key function is required.
pub struct RouterBuilder {
    config: ArchiverConfig,
    store: Option<Arc<dyn ObjectStore>>,
    partition_key: Option<PartitionKeyFn>,
    append: AppendStrategy,
    observer: Arc<dyn ArchiverObserver>,
    clock: Arc<dyn Clock>,
}

impl RouterBuilder {
    pub fn new(config: ArchiverConfig) -> Self {
        RouterBuilder {
            config,
            store: None,
            partition_key: None,
            append: AppendStrategy::Plain,
            observer: Arc::new(TracingObserver),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Use this store instead of opening the one described by the config
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn partition_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<String, PartitionKeyError> + Send + Sync + 'static,
    {
        self.partition_key = Some(Arc::new(f));
        self
    }

    /// Deduplicate lines with `is_dupe(incoming_event, existing_line)`
    pub fn dedupe<F>(mut self, is_dupe: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    {
        self.append = AppendStrategy::dedupe(is_dupe);
        self
    }

    pub fn append_strategy(mut self, append: AppendStrategy) -> Self {
        self.append = append;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ArchiverObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate, open the store if none was given, and start the dispatcher
    /// and sweeper. Nothing is spawned when this returns an error.
    pub async fn build(self) -> Result<Router, ConfigError> {
        self.config.validate()?;
        let partition_key = self.partition_key.ok_or(ConfigError::MissingPartitionKey)?;
        let store = match self.store {
            Some(store) => store,
            None => store::open(&self.config.store).await?,
        };

        let factory = PartitionFactory::new(
            &self.config,
            store,
            self.append,
            self.clock.clone(),
            self.observer.clone(),
        );
        let shared = Arc::new(Shared {
            table: Mutex::new(HashMap::new()),
            factory,
            partition_key,
            partition_timeout: self.config.partition_timeout,
            clock: self.clock,
            observer: self.observer,
            counters: Counters::default(),
        });

        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity);
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), rx, cancel.clone()));
        let sweeper = tokio::spawn(sweep_loop(
            shared.clone(),
            self.config.sweep_interval(),
            cancel.clone(),
        ));

        info!(
            partition_timeout_ms = self.config.partition_timeout.as_millis() as u64,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            compression = %self.config.compression,
            key_prefix = %self.config.key_prefix,
            "Archiver started"
        );

        Ok(Router {
            shared,
            tx,
            cancel,
            tasks: Mutex::new(vec![dispatcher, sweeper]),
            closed: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// Router
// ============================================================================

/// Routes events to per-key partitions. Dropping a router without `close`
/// stops its tasks; partitions then flush once more as their handles drop.
pub struct Router {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Router {
    pub fn builder(config: ArchiverConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    /// Queue an event, waiting while the inbound queue is full. The event is
    /// not inspected here.
    pub async fn log(&self, event: Bytes) -> Result<(), LogError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed(event));
        }
        self.tx
            .send(Inbound::Event(event.clone()))
            .await
            .map_err(|_| LogError::Closed(event))?;
        self.shared
            .counters
            .events_received
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue an event without waiting; a full queue rejects the new event
    pub fn try_log(&self, event: Bytes) -> Result<(), LogError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed(event));
        }
        match self.tx.try_send(Inbound::Event(event.clone())) {
            Ok(()) => {
                self.shared
                    .counters
                    .events_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared
                    .counters
                    .events_dropped
                    .fetch_add(1, Ordering::Relaxed);
                Err(LogError::Full(event))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LogError::Closed(event)),
        }
    }

    /// Flush every live partition after all events accepted so far have
    /// reached their partitions
    pub async fn flush(&self) -> Result<(), FlushAllError> {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(Inbound::Flush { response_tx }).await.is_err() {
            return Ok(());
        }
        response_rx.await.unwrap_or(Ok(()))
    }

    /// Live partition for `key`, if any
    pub fn partition(&self, key: &str) -> Option<PartitionHandle> {
        match self.shared.table.lock().get(key) {
            Some(Slot::Active(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Partitions in the table, including ones still draining
    pub fn partition_count(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Storage address used for `key`
    pub fn object_key(&self, key: &str) -> String {
        self.shared.factory.object_key(key)
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.shared.counters;
        RouterStats {
            events_received: c.events_received.load(Ordering::Relaxed),
            events_routed: c.events_routed.load(Ordering::Relaxed),
            events_rerouted: c.events_rerouted.load(Ordering::Relaxed),
            events_skipped: c.events_skipped.load(Ordering::Relaxed),
            events_dropped: c.events_dropped.load(Ordering::Relaxed),
            partitions_created: c.partitions_created.load(Ordering::Relaxed),
            partitions_evicted: c.partitions_evicted.load(Ordering::Relaxed),
            close_failures: c.close_failures.load(Ordering::Relaxed),
            live_partitions: self.partition_count(),
        }
    }

    /// Run one idle sweep now; returns the number of partitions evicted or
    /// failed while closing
    pub async fn sweep_idle(&self) -> usize {
        self.shared.sweep_idle().await
    }

    /// Stop intake, route everything already accepted, then close every
    /// partition concurrently. Every failure is signalled and returned; one
    /// failing partition never stops the others from closing. A second call
    /// returns immediately.
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Router task failed");
            }
        }

        let partitions: Vec<(String, PartitionHandle)> = self
            .shared
            .table
            .lock()
            .drain()
            .filter_map(|(key, slot)| match slot {
                Slot::Active(handle) => Some((key, handle)),
                Slot::Draining(_) => None,
            })
            .collect();
        let count = partitions.len();

        let closes = partitions
            .into_iter()
            .map(|(key, handle)| async move { (key, handle.close().await) });
        let mut failures = Vec::new();
        for (key, result) in join_all(closes).await {
            if let Err(e) = result {
                self.shared
                    .counters
                    .close_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.shared.observer.observe(Signal::PartitionCloseFailed {
                    key: key.clone(),
                    error: e.to_string(),
                });
                failures.push((key, e));
            }
        }

        if failures.is_empty() {
            info!(partitions = count, "Archiver closed");
            Ok(())
        } else {
            warn!(
                partitions = count,
                failed = failures.len(),
                "Archiver closed with failures"
            );
            Err(CloseError { failures })
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("factory", &self.shared.factory)
            .field("partition_timeout", &self.shared.partition_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compression::Compression;
    use crate::observer::ChannelObserver;
    use crate::store::{InMemoryObjectStore, SimulatedObjectStore, SimulatedStoreConfig};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn literal_key(event: &[u8]) -> Result<String, PartitionKeyError> {
        Ok(String::from_utf8(event.to_vec())?)
    }

    /// Key is everything before the first ':'
    fn prefix_key(event: &[u8]) -> Result<String, PartitionKeyError> {
        let text = std::str::from_utf8(event)?;
        match text.split_once(':') {
            Some((key, _)) => Ok(key.to_string()),
            None => Err("missing ':'".into()),
        }
    }

    struct Harness {
        router: Router,
        clock: ManualClock,
        signals: UnboundedReceiver<Signal>,
    }

    async fn harness<F>(store: Arc<dyn ObjectStore>, key: F) -> Harness
    where
        F: Fn(&[u8]) -> Result<String, PartitionKeyError> + Send + Sync + 'static,
    {
        let clock = ManualClock::new(0);
        let (observer, signals) = ChannelObserver::new();
        let router = Router::builder(ArchiverConfig::test())
            .store(store)
            .partition_key(key)
            .clock(Arc::new(clock.clone()))
            .observer(Arc::new(observer))
            .build()
            .await
            .unwrap();
        Harness {
            router,
            clock,
            signals,
        }
    }

    async fn next_matching<P>(signals: &mut UnboundedReceiver<Signal>, pred: P) -> Signal
    where
        P: Fn(&Signal) -> bool,
    {
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
                .await
                .expect("timed out waiting for signal")
                .expect("observer channel closed");
            if pred(&signal) {
                return signal;
            }
        }
    }

    #[tokio::test]
    async fn test_routes_by_literal_key() {
        let h = harness(Arc::new(InMemoryObjectStore::new()), literal_key).await;

        for e in ["1", "2", "1"] {
            h.router.log(Bytes::from(e)).await.unwrap();
        }
        h.router.flush().await.unwrap();

        assert_eq!(h.router.partition_count(), 2);
        let one = h.router.partition("1").unwrap();
        assert_eq!(one.snapshot().await.unwrap(), Bytes::from("11"));
        let two = h.router.partition("2").unwrap();
        assert_eq!(two.snapshot().await.unwrap(), Bytes::from("2"));

        let stats = h.router.stats();
        assert_eq!(stats.events_received, 3);
        assert_eq!(stats.events_routed, 3);
        assert_eq!(stats.partitions_created, 2);
        assert_eq!(stats.live_partitions, 2);
    }

    #[tokio::test]
    async fn test_key_failure_skips_event() {
        let mut h = harness(Arc::new(InMemoryObjectStore::new()), prefix_key).await;

        h.router.log(Bytes::from_static(b"no separator")).await.unwrap();
        h.router.log(Bytes::from_static(b"a:ok\n")).await.unwrap();
        h.router.flush().await.unwrap();

        assert_eq!(h.router.partition_count(), 1);
        assert_eq!(h.router.stats().events_skipped, 1);
        let signal = next_matching(&mut h.signals, |s| matches!(s, Signal::EventSkipped { .. })).await;
        assert!(matches!(signal, Signal::EventSkipped { error } if error.contains("missing")));
    }

    #[tokio::test]
    async fn test_flush_persists_with_prefix() {
        let store = Arc::new(InMemoryObjectStore::new());
        let h = harness(store.clone(), prefix_key).await;

        h.router.log(Bytes::from_static(b"k:1\n")).await.unwrap();
        h.router.log(Bytes::from_static(b"k:2\n")).await.unwrap();
        h.router.flush().await.unwrap();

        assert_eq!(h.router.object_key("k"), "test/k");
        assert_eq!(store.get("test/k").await.unwrap(), b"k:1\nk:2\n");
    }

    #[tokio::test]
    async fn test_idle_partition_evicted_and_reseeded() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut h = harness(store.clone(), prefix_key).await;

        h.router.log(Bytes::from_static(b"a:first\n")).await.unwrap();
        h.router.log(Bytes::from_static(b"b:other\n")).await.unwrap();
        h.router.flush().await.unwrap();

        h.clock.advance(Duration::from_secs(30));
        assert_eq!(h.router.sweep_idle().await, 0);

        // b stays active, a goes idle
        h.router.log(Bytes::from_static(b"b:again\n")).await.unwrap();
        h.router.flush().await.unwrap();
        h.clock.advance(Duration::from_secs(30));
        assert_eq!(h.router.sweep_idle().await, 1);

        assert!(h.router.partition("a").is_none());
        assert!(h.router.partition("b").is_some());
        assert_eq!(store.get("test/a").await.unwrap(), b"a:first\n");
        let signal = next_matching(&mut h.signals, |s| {
            matches!(s, Signal::PartitionEvicted { .. })
        })
        .await;
        assert_eq!(
            signal,
            Signal::PartitionEvicted {
                key: "a".to_string(),
                idle: Duration::from_secs(60)
            }
        );

        // A later event for the same key starts a new partition seeded from the store
        h.router.log(Bytes::from_static(b"a:second\n")).await.unwrap();
        h.router.flush().await.unwrap();
        let a = h.router.partition("a").unwrap();
        assert_eq!(a.snapshot().await.unwrap(), Bytes::from("a:first\na:second\n"));
        assert_eq!(h.router.stats().partitions_created, 3);
        assert_eq!(h.router.stats().partitions_evicted, 1);
    }

    #[tokio::test]
    async fn test_eviction_persists_exactly_once() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedStoreConfig::no_faults(),
        );
        let h = harness(Arc::new(store.clone()), prefix_key).await;

        h.router.log(Bytes::from_static(b"a:1\n")).await.unwrap();
        h.router.flush().await.unwrap();
        let before = store.stats().put_attempts;

        h.clock.advance(Duration::from_secs(61));
        assert_eq!(h.router.sweep_idle().await, 1);
        assert_eq!(store.stats().put_attempts, before + 1);
        assert_eq!(h.router.partition_count(), 0);
    }

    #[tokio::test]
    async fn test_close_reports_failure_and_flushes_others() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedStoreConfig::no_faults(),
        );
        store.fail_puts_with_prefix("test/bad");
        let mut h = harness(Arc::new(store.clone()), prefix_key).await;

        h.router.log(Bytes::from_static(b"good:1\n")).await.unwrap();
        h.router.log(Bytes::from_static(b"bad:1\n")).await.unwrap();

        let err = h.router.close().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "bad");
        assert!(matches!(
            err.failures[0].1,
            crate::error::FlushError::Persist { attempts: 10, .. }
        ));

        assert_eq!(store.inner().get("test/good").await.unwrap(), b"good:1\n");
        assert!(store.inner().get("test/bad").await.is_err());

        let signal = next_matching(&mut h.signals, |s| {
            matches!(s, Signal::PartitionCloseFailed { .. })
        })
        .await;
        assert!(matches!(signal, Signal::PartitionCloseFailed { key, .. } if key == "bad"));
        assert_eq!(h.router.stats().close_failures, 1);
    }

    #[tokio::test]
    async fn test_close_routes_queued_events_then_rejects() {
        let store = Arc::new(InMemoryObjectStore::new());
        let h = harness(store.clone(), prefix_key).await;

        let mut expected = Vec::new();
        for i in 0..50 {
            let line = format!("k:{}\n", i);
            expected.extend_from_slice(line.as_bytes());
            h.router.log(Bytes::from(line)).await.unwrap();
        }
        h.router.close().await.unwrap();

        assert_eq!(store.get("test/k").await.unwrap(), expected);
        assert!(h.router.is_closed());
        assert_eq!(h.router.partition_count(), 0);

        let late = Bytes::from_static(b"k:late\n");
        assert_eq!(h.router.log(late.clone()).await, Err(LogError::Closed(late.clone())));
        assert_eq!(h.router.try_log(late.clone()), Err(LogError::Closed(late)));
        h.router.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_eviction_never_loses_events() {
        let store = Arc::new(InMemoryObjectStore::new());
        let h = harness(store.clone(), prefix_key).await;
        let router = Arc::new(h.router);

        let sweeper = {
            let router = router.clone();
            let clock = h.clock.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    clock.advance(Duration::from_secs(61));
                    router.sweep_idle().await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut expected = Vec::new();
        for i in 0..500 {
            let line = format!("k:{}\n", i);
            expected.extend_from_slice(line.as_bytes());
            router.log(Bytes::from(line)).await.unwrap();
            if i % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
        sweeper.await.unwrap();
        router.close().await.unwrap();

        assert_eq!(store.get("test/k").await.unwrap(), expected);
        let stats = router.stats();
        assert_eq!(stats.events_routed, 500);
        assert_eq!(stats.close_failures, 0);
        assert!(stats.partitions_created >= 1);
    }

    #[tokio::test]
    async fn test_dedupe_router() {
        let clock = ManualClock::new(0);
        let router = Router::builder(ArchiverConfig::test())
            .store(Arc::new(InMemoryObjectStore::new()))
            .partition_key(|_| Ok("all".to_string()))
            .dedupe(|event, line| event == line)
            .clock(Arc::new(clock))
            .build()
            .await
            .unwrap();

        for e in ["a\n", "b\n", "b\n", "c\n", "a\n", "c\n", "b\n", "c\n", "c\n"] {
            router.log(Bytes::from(e)).await.unwrap();
        }
        router.flush().await.unwrap();

        let all = router.partition("all").unwrap();
        assert_eq!(all.snapshot().await.unwrap(), Bytes::from("a\nb\nc\n"));
    }

    #[tokio::test]
    async fn test_try_log_rejects_when_full() {
        let mut config = ArchiverConfig::test();
        config.event_queue_capacity = 1;
        let router = Router::builder(config)
            .store(Arc::new(InMemoryObjectStore::new()))
            .partition_key(literal_key)
            .build()
            .await
            .unwrap();

        // The dispatcher may take one event off the queue; keep pushing until full
        let mut rejected = None;
        for i in 0..10_000 {
            if let Err(e) = router.try_log(Bytes::from(format!("{}", i % 3))) {
                rejected = Some(e);
                break;
            }
        }
        assert!(matches!(rejected, Some(LogError::Full(_))));
        assert!(router.stats().events_dropped >= 1);
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_requires_partition_key() {
        let result = Router::builder(ArchiverConfig::test())
            .store(Arc::new(InMemoryObjectStore::new()))
            .build()
            .await;
        assert!(matches!(result, Err(ConfigError::MissingPartitionKey)));
    }

    #[tokio::test]
    async fn test_build_rejects_zero_timeout() {
        let mut config = ArchiverConfig::test();
        config.partition_timeout = Duration::ZERO;
        let result = Router::builder(config)
            .partition_key(literal_key)
            .build()
            .await;
        assert!(matches!(result, Err(ConfigError::ZeroPartitionTimeout)));
    }

    #[tokio::test]
    async fn test_gzip_objects_decode_to_buffer() {
        let mut config = ArchiverConfig::test();
        config.compression = Compression::Gzip;
        let store = Arc::new(InMemoryObjectStore::new());
        let router = Router::builder(config)
            .store(store.clone())
            .partition_key(prefix_key)
            .build()
            .await
            .unwrap();

        router.log(Bytes::from_static(b"z:payload\n")).await.unwrap();
        router.close().await.unwrap();

        let stored = store.get("test/z").await.unwrap();
        assert_eq!(Compression::Gzip.decompress(&stored).unwrap(), b"z:payload\n");
    }

    #[tokio::test]
    async fn test_partition_closed_through_handle_is_replaced() {
        let store = Arc::new(InMemoryObjectStore::new());
        let h = harness(store.clone(), prefix_key).await;

        h.router.log(Bytes::from_static(b"k:1\n")).await.unwrap();
        h.router.flush().await.unwrap();
        h.router.partition("k").unwrap().close().await.unwrap();

        h.router.log(Bytes::from_static(b"k:2\n")).await.unwrap();
        h.router.close().await.unwrap();
        assert_eq!(store.get("test/k").await.unwrap(), b"k:1\nk:2\n");
    }

    #[tokio::test]
    async fn test_handle_close_in_flight_is_not_overtaken_by_replacement() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedStoreConfig {
                latency_range_us: (100_000, 100_000),
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let h = harness(Arc::new(store.clone()), prefix_key).await;

        h.router.log(Bytes::from_static(b"k:1\n")).await.unwrap();
        h.router.flush().await.unwrap();
        h.router.log(Bytes::from_static(b"k:2\n")).await.unwrap();
        h.router.log(Bytes::from_static(b"k:sync\n")).await.unwrap();

        let handle = h.router.partition("k").unwrap();
        let close = tokio::spawn(async move { handle.close().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Arrives while the old writer's final put is still sleeping
        h.router.log(Bytes::from_static(b"k:3\n")).await.unwrap();
        h.router.close().await.unwrap();
        close.await.unwrap().unwrap();

        assert_eq!(
            store.inner().get("test/k").await.unwrap(),
            b"k:1\nk:2\nk:sync\nk:3\n"
        );
        assert_eq!(h.router.stats().partitions_created, 2);
    }
}
