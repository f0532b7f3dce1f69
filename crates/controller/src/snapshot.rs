//! State snapshots: the full simulation state rendered for the modeller once per report.

use chrono::{NaiveTime, Timelike};
use modelsync_core::{DiversionUpdate, IncidentStatus, IncidentUpdate, SimTime};
use modelsync_net::{ConnectionError, Element};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::lock;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// How updates for an incident that has not been reported yet are held back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    /// Every staged update is reported, one per snapshot, in arrival order.
    #[default]
    Fifo,
    /// Only the latest staged update survives (legacy behaviour).
    SingleSlot,
}

/// Where rendered snapshots go.
pub trait SnapshotOutput: Send + Sync {
    /// Publish one rendered document.
    fn publish(&self, document: String) -> Result<(), ConnectionError>;
}

impl<F> SnapshotOutput for F
where
    F: Fn(String) -> Result<(), ConnectionError> + Send + Sync,
{
    fn publish(&self, document: String) -> Result<(), ConnectionError> {
        self(document)
    }
}

/// Snapshot settings.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Seconds between two reports, echoed in the basic section.
    pub report_interval_secs: u64,
    /// Wall-clock time at simulation second zero.
    pub day_start: NaiveTime,
    /// Staging behaviour for unreported incidents.
    pub staging: StagingMode,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 1,
            day_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            staging: StagingMode::Fifo,
        }
    }
}

#[derive(Default)]
struct ProducerState {
    network_id: Option<u32>,
    network_loaded: bool,
    running: bool,
    clock: SimTime,
    incidents: BTreeMap<String, IncidentUpdate>,
    staged: HashMap<String, VecDeque<IncidentUpdate>>,
    diversions: BTreeMap<String, DiversionUpdate>,
}

impl ProducerState {
    fn any_incident_active(&self) -> bool {
        self.incidents.values().any(|incident| !incident.is_cleared())
    }
}

/// Builds and publishes state snapshots.
///
/// All operations are cheap and non-blocking: publishing only queues the document on the
/// outbound link.
pub struct SnapshotProducer {
    config: SnapshotConfig,
    output: Arc<dyn SnapshotOutput>,
    state: Mutex<ProducerState>,
}

impl SnapshotProducer {
    /// Producer publishing into `output`.
    pub fn new(config: SnapshotConfig, output: Arc<dyn SnapshotOutput>) -> Self {
        Self {
            config,
            output,
            state: Mutex::new(ProducerState::default()),
        }
    }

    /// Request network `id` and publish a snapshot announcing it.
    pub fn load_network(&self, id: u32) {
        let document = {
            let mut state = lock(&self.state);
            state.network_id = Some(id);
            state.network_loaded = false;
            self.render(&state)
        };
        tracing::info!(network = id, "Network load requested");
        self.publish(document);
    }

    /// Mark the requested network as loaded; the next update carries full data.
    pub fn network_loaded(&self) {
        let mut state = lock(&self.state);
        if !state.network_loaded {
            tracing::info!(network = ?state.network_id, "Network loaded");
        }
        state.network_loaded = true;
    }

    /// Whether the modeller reported the network loaded.
    pub fn is_network_loaded(&self) -> bool {
        lock(&self.state).network_loaded
    }

    /// Network requested by the last [`load_network`](Self::load_network).
    pub fn requested_network(&self) -> Option<u32> {
        lock(&self.state).network_id
    }

    /// Whether the simulation is running.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Last recorded simulation time.
    pub fn clock(&self) -> SimTime {
        lock(&self.state).clock
    }

    /// Advance the clock by `secs` without publishing; returns the new time.
    pub fn advance_clock(&self, secs: u64) -> SimTime {
        let mut state = lock(&self.state);
        state.clock = state.clock.advance(secs);
        state.clock
    }

    /// Start the simulation and publish a snapshot at time zero once a network was requested.
    pub fn start_simulation(&self) {
        let document = {
            let mut state = lock(&self.state);
            state.running = true;
            state.clock = SimTime::ZERO;
            state.network_id.map(|_| self.render(&state))
        };
        tracing::info!("Simulation started");
        if let Some(document) = document {
            self.publish(document);
        }
    }

    /// Drop every incident and diversion and stop the simulation; publishes an empty snapshot
    /// when the network is loaded.
    pub fn reset_simulation(&self) {
        let document = {
            let mut state = lock(&self.state);
            state.running = false;
            state.clock = SimTime::ZERO;
            state.incidents.clear();
            state.staged.clear();
            state.diversions.clear();
            state.network_loaded.then(|| self.render(&state))
        };
        tracing::info!("Simulation reset");
        if let Some(document) = document {
            self.publish(document);
        }
    }

    /// Record `time`; publish a snapshot if the network is loaded.
    ///
    /// Returns whether a snapshot was published.
    pub fn send_update(&self, time: SimTime) -> bool {
        let document = {
            let mut state = lock(&self.state);
            state.clock = time;
            if !state.network_loaded {
                return false;
            }
            let document = self.render(&state);
            self.after_report(&mut state);
            document
        };
        self.publish(document);
        true
    }

    /// Apply an incident update.
    ///
    /// An update for an incident whose current entry has not been reported yet is staged so
    /// that every status reaches at least one snapshot.
    pub fn update_incident(&self, update: IncidentUpdate) {
        let mut state = lock(&self.state);
        let unreported = state.incidents.get(&update.id).is_some_and(|current| {
            matches!(current.status, IncidentStatus::New | IncidentStatus::Changed)
                || current.is_cleared()
        });
        let backlog = state
            .staged
            .get(&update.id)
            .is_some_and(|queue| !queue.is_empty());

        if !unreported && !backlog {
            tracing::debug!(incident = update.id.as_str(), status = %update.status, "Incident updated");
            state.incidents.insert(update.id.clone(), update);
            return;
        }

        let queue = state.staged.entry(update.id.clone()).or_default();
        if self.config.staging == StagingMode::SingleSlot && !queue.is_empty() {
            tracing::debug!(incident = update.id.as_str(), "Staged incident update replaced");
            queue.clear();
        }
        queue.push_back(update);
    }

    /// Apply a diversion update; cleared diversions are removed.
    pub fn update_diversion(&self, update: DiversionUpdate) {
        let mut state = lock(&self.state);
        if update.cleared {
            state.diversions.remove(&update.id);
        } else {
            state.diversions.insert(update.id.clone(), update);
        }
    }

    /// Render the current state without publishing it.
    pub fn render_current(&self) -> String {
        self.render(&lock(&self.state))
    }

    fn publish(&self, document: String) {
        if let Err(err) = self.output.publish(document) {
            tracing::warn!(%err, "Snapshot not published");
        }
    }

    fn after_report(&self, state: &mut ProducerState) {
        state.incidents.retain(|_, incident| !incident.is_cleared());
        for incident in state.incidents.values_mut() {
            incident.status = incident.status.after_report();
        }
        let ProducerState {
            incidents, staged, ..
        } = state;
        staged.retain(|id, queue| {
            if let Some(next) = queue.pop_front() {
                incidents.insert(id.clone(), next);
            }
            !queue.is_empty()
        });
    }

    fn render(&self, state: &ProducerState) -> String {
        let mut root = Element::new("Paramics").with_child(
            Element::new("Basic")
                .with_child(Element::leaf("Interval", self.config.report_interval_secs))
                .with_child(Element::leaf("Network_ID", state.network_id.unwrap_or(0)))
                .with_child(Element::leaf("Simulation", flag(state.running)))
                .with_child(Element::leaf("Incident", flag(state.any_incident_active()))),
        );

        if state.network_loaded {
            if state.running {
                let (hour, minute, second) = wall_clock(self.config.day_start, state.clock);
                root.push(
                    Element::new("Simulation_Data")
                        .with_child(Element::leaf("Hour", hour))
                        .with_child(Element::leaf("Minute", minute))
                        .with_child(Element::leaf("Second", second)),
                );
            }

            let mut incidents = Element::new("Incidents");
            for incident in state.incidents.values().filter(|i| !i.is_cleared()) {
                incidents.push(render_incident(incident));
            }
            if !incidents.children.is_empty() {
                root.push(incidents);
            }

            if !state.diversions.is_empty() {
                let mut management = Element::new("Management");
                for diversion in state.diversions.values() {
                    management.push(
                        Element::new("Diversion")
                            .with_child(Element::leaf("ID", &diversion.id))
                            .with_child(Element::leaf("Location", &diversion.location))
                            .with_child(Element::leaf("Route", diversion.route.join(","))),
                    );
                }
                root.push(management);
            }
        }

        root.to_xml()
    }
}

fn render_incident(incident: &IncidentUpdate) -> Element {
    let lanes = incident
        .lanes_affected
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Element::new("Incident")
        .with_child(Element::leaf("ID", &incident.id))
        .with_child(Element::leaf("Status", incident.status))
        .with_child(Element::leaf("Location", &incident.location))
        .with_child(Element::leaf("Type", &incident.incident_type))
        .with_child(Element::leaf("Lanes_Affected", lanes))
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

/// Wall-clock hour, minute and second of `time`, wrapping at midnight.
fn wall_clock(day_start: NaiveTime, time: SimTime) -> (u32, u32, u32) {
    let secs = (u64::from(day_start.num_seconds_from_midnight()) + time.as_secs() % SECONDS_PER_DAY)
        % SECONDS_PER_DAY;
    let secs = secs as u32;
    (secs / 3600, secs / 60 % 60, secs % 60)
}
