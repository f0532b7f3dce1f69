//! Telemetry records flowing upward from the relay and the modeller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EndpointId;

/// Average speeds measured at one modelled camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSample {
    /// Camera identifier.
    pub camera_id: String,
    /// Average speed in the north/east bound direction.
    pub speed_ne: f64,
    /// Average speed in the south/west bound direction.
    pub speed_sw: f64,
}

/// Direction of a file transfer on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoDirection {
    /// Content read out of a modeller-written file.
    FileRead,
    /// Content written into a modeller-read file.
    FileWrite,
}

/// I/O accounting event for observability panels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoActivity {
    /// Endpoint that moved the bytes.
    pub endpoint_id: EndpointId,
    /// Transfer direction.
    pub direction: IoDirection,
    /// Number of bytes moved.
    pub bytes: usize,
    /// Wall-clock time of the transfer.
    pub at: DateTime<Utc>,
}

impl IoActivity {
    /// Record a transfer that happened just now.
    pub fn now(endpoint_id: EndpointId, direction: IoDirection, bytes: usize) -> Self {
        Self {
            endpoint_id,
            direction,
            bytes,
            at: Utc::now(),
        }
    }
}
