//! Simulated Object Store with Fault Injection
//!
//! Wraps another store and injects put/get failures. Randomized faults come
//! from a seeded ChaCha RNG so a failing seed replays the same sequence.
//! Scripted faults (`fail_next_puts`, `fail_puts_with_prefix`) make single
//! scenarios exact.

use super::{ObjectStore, StoreFuture};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// RNG seed
    pub seed: u64,
    /// Probability of PUT operation failure
    pub put_fail_prob: f64,
    /// Probability of GET operation failure
    pub get_fail_prob: f64,
    /// Probability of operation timeout (PUT and GET)
    pub timeout_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            seed: 0,
            put_fail_prob: 0.01,             // 1%
            get_fail_prob: 0.01,             // 1%
            timeout_prob: 0.005,             // 0.5%
            latency_range_us: (100, 10_000), // 0.1ms - 10ms
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos(seed: u64) -> Self {
        SimulatedStoreConfig {
            seed,
            put_fail_prob: 0.3,
            get_fail_prob: 0.3,
            timeout_prob: 0.05,
            latency_range_us: (0, 1_000),
        }
    }

    /// No random faults; scripted faults still apply
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            seed: 0,
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            timeout_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub timeouts: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
    fail_next_puts: u32,
    failing_prefixes: Vec<String>,
}

impl SimulatedStoreInner {
    fn roll(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.gen_bool(prob.min(1.0))
    }

    fn latency_us(&mut self, (min, max): (u64, u64)) -> u64 {
        if max > min {
            self.rng.gen_range(min..max)
        } else {
            min
        }
    }
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore> {
    inner_store: Arc<S>,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStore> SimulatedObjectStore<S> {
    pub fn new(inner_store: S, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store: Arc::new(inner_store),
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(config.seed),
                stats: SimulatedStoreStats::default(),
                fail_next_puts: 0,
                failing_prefixes: Vec::new(),
            })),
            config,
        }
    }

    /// The wrapped store, for inspecting what actually landed
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Fail the next `n` PUTs regardless of key
    pub fn fail_next_puts(&self, n: u32) {
        self.state.lock().fail_next_puts = n;
    }

    /// Fail every PUT whose key starts with `prefix`
    pub fn fail_puts_with_prefix(&self, prefix: impl Into<String>) {
        self.state.lock().failing_prefixes.push(prefix.into());
    }

    /// Stop all scripted PUT failures
    pub fn heal(&self) {
        let mut s = self.state.lock();
        s.fail_next_puts = 0;
        s.failing_prefixes.clear();
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    async fn simulate_latency(&self) {
        let latency_us = self.state.lock().latency_us(self.config.latency_range_us);
        if latency_us > 0 {
            tokio::time::sleep(std::time::Duration::from_micros(latency_us)).await;
        }
    }
}

impl<S: ObjectStore> Clone for SimulatedObjectStore<S> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ObjectStore> ObjectStore for SimulatedObjectStore<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let fault = {
                let mut s = self.state.lock();
                s.stats.put_attempts += 1;

                if s.roll(self.config.timeout_prob) {
                    s.stats.timeouts += 1;
                    Some(IoError::new(ErrorKind::TimedOut, "simulated timeout"))
                } else if s.fail_next_puts > 0 {
                    s.fail_next_puts -= 1;
                    s.stats.put_failures += 1;
                    Some(IoError::new(ErrorKind::Other, "simulated put failure"))
                } else if s.failing_prefixes.iter().any(|p| key.starts_with(p.as_str()))
                    || s.roll(self.config.put_fail_prob)
                {
                    s.stats.put_failures += 1;
                    Some(IoError::new(ErrorKind::Other, "simulated put failure"))
                } else {
                    None
                }
            };
            if let Some(e) = fault {
                return Err(e);
            }

            self.simulate_latency().await;
            self.inner_store.put(key, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let fault = {
                let mut s = self.state.lock();
                s.stats.get_attempts += 1;

                if s.roll(self.config.timeout_prob) {
                    s.stats.timeouts += 1;
                    Some(IoError::new(ErrorKind::TimedOut, "simulated timeout"))
                } else if s.roll(self.config.get_fail_prob) {
                    s.stats.get_failures += 1;
                    Some(IoError::new(ErrorKind::Other, "simulated get failure"))
                } else {
                    None
                }
            };
            if let Some(e) = fault {
                return Err(e);
            }

            self.simulate_latency().await;
            self.inner_store.get(key).await
        })
    }
}
