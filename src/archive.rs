//! Archive trait
//!
//! The surface applications code against. `Router` is the real archive;
//! `NoopArchive` only traces events and is meant for development and for
//! tests of code that produces events.

use crate::error::{CloseError, LogError};
use crate::router::Router;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

pub trait Archive: Send + Sync {
    /// Submit an event. Persistence problems are never reported here.
    fn log(&self, event: Bytes) -> BoxFuture<'_, Result<(), LogError>>;

    /// Persist everything and stop
    fn close(&self) -> BoxFuture<'_, Result<(), CloseError>>;
}

impl Archive for Router {
    fn log(&self, event: Bytes) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(Router::log(self, event))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CloseError>> {
        Box::pin(Router::close(self))
    }
}

/// Archive that traces each event and stores nothing
#[derive(Debug, Default)]
pub struct NoopArchive {
    logged: AtomicU64,
    closed: AtomicBool,
}

impl NoopArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events accepted so far
    pub fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }
}

impl Archive for NoopArchive {
    fn log(&self, event: Bytes) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(LogError::Closed(event));
            }
            self.logged.fetch_add(1, Ordering::Relaxed);
            info!(event = %String::from_utf8_lossy(&event), "Event logged");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CloseError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                info!(logged = self.logged(), "Closing");
            }
            Ok(())
        })
    }
}
