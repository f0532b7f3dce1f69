#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod incident;
pub mod observer;
pub mod state;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export commonly used types
pub use incident::{DiversionUpdate, IncidentStatus, IncidentUpdate};
pub use observer::{CameraObserver, ConnectionObserver, IoObserver, StatusObserver};
pub use state::{ConnectionState, NetworkStatus, ParseStatusError};
pub use telemetry::{CameraSample, IoActivity, IoDirection};

/// Simulation clock in whole seconds (the simulator ticks at 1 Hz).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTime(pub u64);

impl SimTime {
    /// Start of every simulation run.
    pub const ZERO: Self = Self(0);

    /// Advance by `secs` seconds.
    pub fn advance(self, secs: u64) -> Self {
        Self(self.0 + secs)
    }

    /// Elapsed seconds since the run started.
    pub fn as_secs(self) -> u64 {
        self.0
    }
}

/// Identifier of a registered endpoint, unique within one session.
///
/// Empty ids are reserved for session-control messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Wrap a raw id.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The id used by session-control messages.
    pub fn control() -> Self {
        Self(String::new())
    }

    /// Whether this is the session-control id.
    pub fn is_control(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The two kinds of synchronisation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Polls a modeller-written file and forwards its content to the controller.
    Source,
    /// Accepts controller content and writes it to a modeller-read file.
    Sink,
}

impl EndpointKind {
    /// Prefix used when the controller mints ids for this kind.
    pub fn id_prefix(self) -> &'static str {
        match self {
            EndpointKind::Source => "R",
            EndpointKind::Sink => "W",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_id_is_empty() {
        assert!(EndpointId::control().is_control());
        assert!(!EndpointId::from("W1").is_control());
    }

    #[test]
    fn sim_time_advances() {
        assert_eq!(SimTime::ZERO.advance(5).as_secs(), 5);
    }
}
