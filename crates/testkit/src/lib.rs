#![warn(missing_docs)]
//! Test surfaces for the sync protocol: simulated modeller file traffic, polling waits and
//! recording doubles for outbound links and observers.

mod doubles;
mod modeler;

use std::thread;
use std::time::{Duration, Instant};

pub use doubles::*;
pub use modeler::*;

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
///
/// Returns the final evaluation, so callers can `assert!` on it directly.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return condition();
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Install a compact `tracing` subscriber for test output. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}
