//! Recording doubles for links and observers.

use modelsync_net::{ConnectionError, Envelope, Message, Outbound};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::wait_until;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe, cloneable list of recorded values.
#[derive(Debug)]
pub struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Recorder<T> {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one value.
    pub fn push(&self, value: T) {
        lock(&self.values).push(value);
    }

    /// Number of recorded values.
    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` values were recorded.
    pub fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.len() >= count)
    }

    /// Drain every recorded value.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.values))
    }
}

impl<T: Clone> Recorder<T> {
    /// Copy of every recorded value.
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.values).clone()
    }

    /// Most recent value.
    pub fn last(&self) -> Option<T> {
        lock(&self.values).last().cloned()
    }
}

impl<T: Send + 'static> Recorder<T> {
    /// Callback that records its argument, usable wherever a one-argument observer is accepted.
    pub fn callback(&self) -> impl Fn(T) + Send + Sync + 'static {
        let recorder = self.clone();
        move |value| recorder.push(value)
    }
}

/// [`Outbound`] double that records every envelope instead of sending it.
#[derive(Clone, Default)]
pub struct RecordingOutbound {
    sent: Recorder<Envelope>,
    disconnected: Arc<AtomicBool>,
}

impl RecordingOutbound {
    /// Connected double with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail as if the link dropped.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Copy of every envelope sent so far.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent.snapshot()
    }

    /// Every envelope sent so far, validated.
    pub fn messages(&self) -> Vec<Message> {
        self.sent
            .snapshot()
            .iter()
            .filter_map(|envelope| envelope.message().ok())
            .collect()
    }

    /// Drain recorded envelopes.
    pub fn take(&self) -> Vec<Envelope> {
        self.sent.take()
    }

    /// Number of envelopes sent.
    pub fn len(&self) -> usize {
        self.sent.len()
    }

    /// Whether nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    /// Wait until at least `count` envelopes were sent.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        self.sent.wait_for_len(count, timeout)
    }
}

impl Outbound for RecordingOutbound {
    fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.sent.push(envelope);
        Ok(())
    }
}
