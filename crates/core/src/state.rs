//! Connection and modeller network states reported to the simulator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Connection state as observed by the controller.
///
/// The transport itself only produces `Connecting`, `Connected`, `Dropped`, `Unreachable` and
/// `Disconnected`; the loading states are parsed out of modeller status payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing attempted yet.
    #[default]
    Unknown,
    /// Opening the socket.
    Connecting,
    /// Socket open and reset exchanged.
    Connected,
    /// Modeller is loading a network.
    Loading,
    /// Modeller is warming the loaded network.
    Warming,
    /// Modeller reports the network ready.
    Loaded,
    /// The live connection failed.
    Dropped,
    /// The relay could not be reached.
    Unreachable,
    /// Closed on request.
    Disconnected,
}

impl ConnectionState {
    /// Whether the transport is usable in this state.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Loading
                | ConnectionState::Warming
                | ConnectionState::Loaded
        )
    }
}

/// Network status values written by the modeller into its status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// Network load in progress.
    Loading,
    /// Network loaded, warm-up running.
    Warming,
    /// Network ready for simulation.
    Loaded,
}

impl NetworkStatus {
    /// Wire spelling used by the modeller.
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkStatus::Loading => "LOADING",
            NetworkStatus::Warming => "WARMING",
            NetworkStatus::Loaded => "LOADED",
        }
    }
}

impl From<NetworkStatus> for ConnectionState {
    fn from(status: NetworkStatus) -> Self {
        match status {
            NetworkStatus::Loading => ConnectionState::Loading,
            NetworkStatus::Warming => ConnectionState::Warming,
            NetworkStatus::Loaded => ConnectionState::Loaded,
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a status keyword is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised status `{0}`")]
pub struct ParseStatusError(pub String);

impl FromStr for NetworkStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOADING" => Ok(NetworkStatus::Loading),
            "WARMING" => Ok(NetworkStatus::Warming),
            "LOADED" => Ok(NetworkStatus::Loaded),
            _ => Err(ParseStatusError(s.trim().to_string())),
        }
    }
}
