//! Append strategies
//!
//! The only behavior that differs between a plain and a deduplicating
//! partition is how an accepted event lands in the buffer.

use bytes::BytesMut;
use std::sync::Arc;

/// `(incoming_event, existing_line) -> is_duplicate`
///
/// `existing_line` includes its trailing `\n` when it has one.
pub type DedupePredicate = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub enum AppendStrategy {
    /// Append raw bytes
    #[default]
    Plain,
    /// Append unless an already-buffered line is a duplicate of the event
    Dedupe(DedupePredicate),
}

impl AppendStrategy {
    pub fn dedupe<F>(is_dupe: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    {
        AppendStrategy::Dedupe(Arc::new(is_dupe))
    }

    /// Dedupe on byte-exact line equality
    pub fn exact_lines() -> Self {
        Self::dedupe(|event, line| event == line)
    }

    pub fn is_dedupe(&self) -> bool {
        matches!(self, AppendStrategy::Dedupe(_))
    }

    /// Apply `event` to `buffer`. Returns false if the event was a duplicate
    /// and the buffer is unchanged.
    pub fn append(&self, buffer: &mut BytesMut, event: &[u8]) -> bool {
        match self {
            AppendStrategy::Plain => {
                buffer.extend_from_slice(event);
                true
            }
            AppendStrategy::Dedupe(is_dupe) => {
                if lines(&buffer[..]).any(|line| is_dupe(event, line)) {
                    return false;
                }
                buffer.extend_from_slice(event);
                true
            }
        }
    }
}

impl std::fmt::Debug for AppendStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppendStrategy::Plain => f.write_str("Plain"),
            AppendStrategy::Dedupe(_) => f.write_str("Dedupe(..)"),
        }
    }
}

/// Lines of `buffer` in order, each with its trailing `\n`. A final fragment
/// without a newline is yielded as a line too.
pub fn lines(buffer: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut start = 0;
    let mut ends = memchr::memchr_iter(b'\n', buffer);
    std::iter::from_fn(move || {
        if start >= buffer.len() {
            return None;
        }
        let end = ends.next().map(|i| i + 1).unwrap_or(buffer.len());
        let line = &buffer[start..end];
        start = end;
        Some(line)
    })
}
