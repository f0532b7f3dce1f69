//! Incident and diversion updates fed into state snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reporting status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentStatus {
    /// Reported for the first time in the next snapshot.
    New,
    /// Details changed since the last snapshot.
    Changed,
    /// Already reported and unchanged.
    OnGoing,
    /// Resolved; omitted from snapshots and then dropped.
    Cleared,
}

impl IncidentStatus {
    /// Wire spelling used in snapshot documents.
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::New => "NEW",
            IncidentStatus::Changed => "CHANGED",
            IncidentStatus::OnGoing => "ON_GOING",
            IncidentStatus::Cleared => "CLEARED",
        }
    }

    /// Status after one snapshot has carried this incident.
    pub fn after_report(self) -> Self {
        match self {
            IncidentStatus::New | IncidentStatus::Changed | IncidentStatus::OnGoing => {
                IncidentStatus::OnGoing
            }
            IncidentStatus::Cleared => IncidentStatus::Cleared,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One incident update from the incident timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentUpdate {
    /// Incident identifier, stable across updates.
    pub id: String,
    /// Status carried by this update.
    pub status: IncidentStatus,
    /// Network location (link or node reference).
    pub location: String,
    /// Incident type label (e.g. "COLLISION").
    pub incident_type: String,
    /// Lane numbers blocked by the incident.
    pub lanes_affected: Vec<u32>,
}

impl IncidentUpdate {
    /// Whether this update resolves the incident.
    pub fn is_cleared(&self) -> bool {
        self.status == IncidentStatus::Cleared
    }
}

/// One diversion (traffic management) update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversionUpdate {
    /// Diversion identifier.
    pub id: String,
    /// Where the diversion starts.
    pub location: String,
    /// Ordered links making up the diverted route.
    pub route: Vec<String>,
    /// Whether the diversion has been lifted.
    pub cleared: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_statuses_settle_to_ongoing() {
        assert_eq!(IncidentStatus::New.after_report(), IncidentStatus::OnGoing);
        assert_eq!(IncidentStatus::Changed.after_report(), IncidentStatus::OnGoing);
        assert_eq!(IncidentStatus::Cleared.after_report(), IncidentStatus::Cleared);
    }
}
