//! Accounting of entry payloads held in memory
//!
//! Every payload handed to an archive is drained into memory right away, since
//! most sources cannot be read twice. A [`ByteTracker`] keeps a running total
//! of those buffers and the high-water mark. Several archives may share one
//! tracker to observe a process-wide figure.

use crate::error::Result;
use parking_lot::Mutex;
use std::io::Read;
use std::ops::Deref;
use std::sync::Arc;

/// Current and peak number of tracked bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerSnapshot {
    pub bytes_used: u64,
    pub max_bytes_used: u64,
}

#[derive(Debug, Default)]
struct Counters {
    used: u64,
    max: u64,
}

/// Thread-safe byte counter.
#[derive(Debug, Default)]
pub struct ByteTracker {
    counters: Mutex<Counters>,
}

impl ByteTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(ByteTracker::default())
    }

    /// Drain `source` into memory and track the resulting buffer.
    ///
    /// Nothing is accounted if reading fails.
    pub fn track_stream<R: Read>(self: &Arc<Self>, mut source: R) -> Result<TrackedBytes> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        Ok(self.track_bytes(data))
    }

    /// Take ownership of an already materialized buffer.
    pub fn track_bytes(self: &Arc<Self>, data: Vec<u8>) -> TrackedBytes {
        self.acquire(data.len() as u64);
        TrackedBytes {
            data,
            tracker: Some(Arc::clone(self)),
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let counters = self.counters.lock();
        TrackerSnapshot {
            bytes_used: counters.used,
            max_bytes_used: counters.max,
        }
    }

    pub fn bytes_used(&self) -> u64 {
        self.counters.lock().used
    }

    pub fn max_bytes_used(&self) -> u64 {
        self.counters.lock().max
    }

    fn acquire(&self, len: u64) {
        let mut counters = self.counters.lock();
        counters.used += len;
        counters.max = counters.max.max(counters.used);
    }

    fn release(&self, len: u64) {
        let mut counters = self.counters.lock();
        counters.used = counters.used.saturating_sub(len);
    }
}

/// An in-memory buffer whose size is counted by a [`ByteTracker`] until it is
/// released or dropped.
#[derive(Debug)]
pub struct TrackedBytes {
    data: Vec<u8>,
    tracker: Option<Arc<ByteTracker>>,
}

impl TrackedBytes {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Stop counting this buffer. Calling it more than once has no effect.
    pub fn release(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.release(self.data.len() as u64);
        }
    }
}

impl Deref for TrackedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.release();
    }
}
