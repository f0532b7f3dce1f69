//! Typed upward callbacks, one trait per event kind.
//!
//! Closures with the matching signature implement each trait, so callers can subscribe with a
//! plain `Fn` or forward into a channel.

use crate::{CameraSample, ConnectionState, IoActivity, NetworkStatus};

/// Receives connection state transitions.
pub trait ConnectionObserver: Send + Sync {
    /// Called on every state change.
    fn on_connection_state_changed(&self, state: ConnectionState);
}

/// Receives modeller network status records.
pub trait StatusObserver: Send + Sync {
    /// Called once per complete status record.
    fn on_network_status(&self, status: NetworkStatus, network_id: u32);
}

/// Receives modeller camera speed samples.
pub trait CameraObserver: Send + Sync {
    /// Called once per complete camera record.
    fn on_camera_speed_sample(&self, sample: CameraSample);
}

/// Receives relay file I/O accounting.
pub trait IoObserver: Send + Sync {
    /// Called after every successful file read or write.
    fn on_io_activity(&self, activity: &IoActivity);
}

impl<F> ConnectionObserver for F
where
    F: Fn(ConnectionState) + Send + Sync,
{
    fn on_connection_state_changed(&self, state: ConnectionState) {
        self(state)
    }
}

impl<F> StatusObserver for F
where
    F: Fn(NetworkStatus, u32) + Send + Sync,
{
    fn on_network_status(&self, status: NetworkStatus, network_id: u32) {
        self(status, network_id)
    }
}

impl<F> CameraObserver for F
where
    F: Fn(CameraSample) + Send + Sync,
{
    fn on_camera_speed_sample(&self, sample: CameraSample) {
        self(sample)
    }
}

impl<F> IoObserver for F
where
    F: Fn(&IoActivity) + Send + Sync,
{
    fn on_io_activity(&self, activity: &IoActivity) {
        self(activity)
    }
}
