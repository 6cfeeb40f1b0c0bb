use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::transcript::event::{EventKind, Transcript, TranscriptEvent};

/// Append-only session log.
///
/// Clones share the same log and clock, so every component of one pipeline
/// can hold a handle without a global. Timestamps are milliseconds since
/// [`Recorder::new`] on tokio's clock, which tests can pause and advance.
#[derive(Clone, Debug)]
pub struct Recorder {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    started: Instant,
    enabled: bool,
    events: Mutex<Vec<TranscriptEvent>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::with_enabled(true)
    }

    /// A recorder that drops everything.
    pub fn disabled() -> Self {
        Self::with_enabled(false)
    }

    fn with_enabled(enabled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                started: Instant::now(),
                enabled,
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.inner.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn record(&self, kind: EventKind) {
        if !self.inner.enabled {
            return;
        }
        // Stamp under the lock so concurrent handles stay ordered.
        let mut events = self.inner.events.lock();
        let ts = self.elapsed_ms();
        events.push(TranscriptEvent::new(ts, kind));
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Transcript {
        let events = self.inner.events.lock().clone();
        // Stamping under the lock keeps ts non-decreasing.
        Transcript::from_ordered(events)
    }

    /// Take the log, leaving the recorder empty.
    pub fn drain(&self) -> Transcript {
        let events = std::mem::take(&mut *self.inner.events.lock());
        Transcript::from_ordered(events)
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
