//! Named, cancellable periodic timers backed by a dedicated thread.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a tick callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    /// Keep ticking.
    Continue,
    /// Stop the timer after this tick.
    Stop,
}

/// A periodic task on its own thread.
///
/// Dropping the ticker cancels it and waits for an in-flight tick to finish.
pub struct Ticker {
    name: String,
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a timer that calls `tick` every `period`.
    ///
    /// With `fire_immediately` the first call happens before the first wait.
    pub fn spawn<F>(
        name: impl Into<String>,
        period: Duration,
        fire_immediately: bool,
        mut tick: F,
    ) -> io::Result<Self>
    where
        F: FnMut() -> TickFlow + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            if fire_immediately && tick() == TickFlow::Stop {
                return;
            }
            loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if tick() == TickFlow::Stop {
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })?;
        Ok(Self {
            name,
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    /// Thread name of this timer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the timer thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the timer and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread out of its wait.
        self.stop.take();
        if let Some(join) = self.join.take() {
            join_unless_current(join, &self.name);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join `handle` unless it is the calling thread, which would deadlock.
pub(crate) fn join_unless_current(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        tracing::error!(thread = name, "Worker thread panicked");
    }
}
