#![warn(missing_docs)]
//! Relay side of the synchronisation protocol: file pollers, file writers and the endpoint
//! registry, served to one controller at a time over TCP.

pub mod activity;
pub mod poller;
pub mod registry;
pub mod server;
pub mod writer;

pub use activity::{ActivityLog, IoFanout, TracingIoObserver};
pub use poller::{FilePoller, SourceFile};
pub use registry::{Endpoint, EndpointRegistry, RegistryOptions};
pub use server::{RelayConfig, RelayHandle, RelayServer};
pub use writer::{FileRelayWriter, DEFAULT_SINK_RETRY};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, recovering the guard if a panicking thread poisoned the mutex.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
