#![warn(missing_docs)]
//! Controller side of the synchronisation protocol, embedded in the simulator.
//!
//! [`Controller`] is the downward interface: it owns the [`Session`], registers the snapshot
//! sink and the status/camera sources on connect, and drives the [`SnapshotProducer`].

pub mod readers;
pub mod session;
pub mod snapshot;

pub use readers::{parse_cameras, parse_status, CameraReader, StatusReader, StatusRecord};
pub use session::{Session, SessionConfig, SourceHandler};
pub use snapshot::{SnapshotConfig, SnapshotOutput, SnapshotProducer, StagingMode};

use modelsync_core::{
    CameraObserver, CameraSample, ConnectionObserver, ConnectionState, DiversionUpdate,
    EndpointId, IncidentUpdate, NetworkStatus, SimTime, StatusObserver,
};
use modelsync_net::{ConnectionError, SyncError, TickFlow, Ticker};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

/// Cadence of the simulation clock.
pub const REPORT_TICK: Duration = Duration::from_secs(1);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Files and cadences the controller registers on connect.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Relay address and socket timeouts.
    pub session: SessionConfig,
    /// Sink file receiving snapshots.
    pub snapshot_file: String,
    /// Source file carrying network status.
    pub status_file: String,
    /// Poll cadence of the status file.
    pub status_interval_secs: u64,
    /// Source file carrying camera samples.
    pub camera_file: String,
    /// Poll cadence of the camera file.
    pub camera_interval_secs: u64,
    /// Snapshot rendering settings.
    pub snapshot: SnapshotConfig,
}

impl ControllerConfig {
    /// Default file names and cadences for a relay at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            session: SessionConfig::new(host, port),
            snapshot_file: "simulator.xml".to_string(),
            status_file: "status.xml".to_string(),
            status_interval_secs: 1,
            camera_file: "cameras.xml".to_string(),
            camera_interval_secs: 5,
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Upward callbacks into the simulator.
#[derive(Clone)]
pub struct ControllerObservers {
    /// Connection and loading state changes.
    pub connection: Arc<dyn ConnectionObserver>,
    /// Raw network status records.
    pub status: Arc<dyn StatusObserver>,
    /// Camera speed samples.
    pub camera: Arc<dyn CameraObserver>,
}

impl Default for ControllerObservers {
    fn default() -> Self {
        Self {
            connection: Arc::new(|_: ConnectionState| {}),
            status: Arc::new(|_: NetworkStatus, _: u32| {}),
            camera: Arc::new(|_: CameraSample| {}),
        }
    }
}

/// Publishes snapshots to whichever sink the current connection registered.
struct SinkOutput {
    session: Weak<Session>,
    sink: Arc<RwLock<Option<EndpointId>>>,
}

impl SnapshotOutput for SinkOutput {
    fn publish(&self, document: String) -> Result<(), ConnectionError> {
        let sink = read_lock(&self.sink)
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        let session = self.session.upgrade().ok_or(ConnectionError::NotConnected)?;
        session.write(&sink, document)
    }
}

/// The simulator's handle on the modeller.
pub struct Controller {
    config: ControllerConfig,
    observers: ControllerObservers,
    session: Arc<Session>,
    producer: Arc<SnapshotProducer>,
    snapshot_sink: Arc<RwLock<Option<EndpointId>>>,
    connecting: Mutex<()>,
    reporting: Mutex<Option<Ticker>>,
}

impl Controller {
    /// Disconnected controller.
    pub fn new(config: ControllerConfig, observers: ControllerObservers) -> Self {
        let session = Arc::new(Session::new(
            config.session.clone(),
            Arc::clone(&observers.connection),
        ));
        let snapshot_sink = Arc::new(RwLock::new(None));
        let producer = Arc::new(SnapshotProducer::new(
            config.snapshot.clone(),
            Arc::new(SinkOutput {
                session: Arc::downgrade(&session),
                sink: Arc::clone(&snapshot_sink),
            }),
        ));
        Self {
            config,
            observers,
            session,
            producer,
            snapshot_sink,
            connecting: Mutex::new(()),
            reporting: Mutex::new(None),
        }
    }

    /// Underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Snapshot producer.
    pub fn producer(&self) -> &Arc<SnapshotProducer> {
        &self.producer
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Sink currently receiving snapshots.
    pub fn snapshot_sink(&self) -> Option<EndpointId> {
        read_lock(&self.snapshot_sink).clone()
    }

    /// Connect and register the snapshot sink plus the status and camera sources.
    ///
    /// A no-op while connected with endpoints registered; after [`reset`](Self::reset) it
    /// registers them again on the live link.
    pub fn connect(&self) -> Result<(), SyncError> {
        let _connecting = lock(&self.connecting);
        if self.session.is_connected() && self.snapshot_sink().is_some() {
            tracing::debug!("Already connected; endpoints kept");
            return Ok(());
        }
        self.session.connect()?;

        let sink = self.session.register_sink(&self.config.snapshot_file)?;
        *write_lock(&self.snapshot_sink) = Some(sink);

        self.session.register_source(
            &self.config.status_file,
            self.config.status_interval_secs,
            Arc::new(StatusReader::new(self.status_router())),
        )?;
        self.session.register_source(
            &self.config.camera_file,
            self.config.camera_interval_secs,
            Arc::new(CameraReader::new(Arc::clone(&self.observers.camera))),
        )?;
        Ok(())
    }

    /// Status records update the connection state, complete the network load and reach the
    /// simulator's status observer.
    fn status_router(&self) -> Arc<dyn StatusObserver> {
        let session = Arc::downgrade(&self.session);
        let producer = Arc::downgrade(&self.producer);
        let forward = Arc::clone(&self.observers.status);
        Arc::new(move |status: NetworkStatus, network_id: u32| {
            if let Some(session) = session.upgrade() {
                session.report_state(ConnectionState::from(status));
            }
            if let Some(producer) = producer.upgrade() {
                if status == NetworkStatus::Loaded
                    && producer.requested_network() == Some(network_id)
                {
                    producer.network_loaded();
                }
            }
            forward.on_network_status(status, network_id);
        })
    }

    /// Stop reporting, send the final reset and close the link. Idempotent.
    pub fn disconnect(&self) {
        self.stop_reporting();
        write_lock(&self.snapshot_sink).take();
        self.session.disconnect();
    }

    /// Drop every endpoint on both sides; call [`connect`](Self::connect) again to re-register.
    pub fn reset(&self) -> Result<(), ConnectionError> {
        write_lock(&self.snapshot_sink).take();
        self.session.reset()
    }

    /// Request network `id`.
    pub fn load_network(&self, id: u32) {
        self.producer.load_network(id);
    }

    /// Mark the requested network loaded.
    pub fn network_loaded(&self) {
        self.producer.network_loaded();
    }

    /// Start the simulation.
    pub fn start_simulation(&self) {
        self.producer.start_simulation();
    }

    /// Reset the simulation state.
    pub fn reset_simulation(&self) {
        self.producer.reset_simulation();
    }

    /// Publish a snapshot for `time` if the network is loaded.
    pub fn send_update(&self, time: SimTime) -> bool {
        self.producer.send_update(time)
    }

    /// Apply an incident update.
    pub fn update_incident(&self, update: IncidentUpdate) {
        self.producer.update_incident(update);
    }

    /// Apply a diversion update.
    pub fn update_diversion(&self, update: DiversionUpdate) {
        self.producer.update_diversion(update);
    }

    /// Run the 1 Hz simulation clock: while the simulation runs, advance it every tick and
    /// publish every `report_interval_secs`. Restarts the clock thread if already running.
    pub fn start_reporting(&self) -> std::io::Result<()> {
        let producer = Arc::clone(&self.producer);
        let every = self.config.snapshot.report_interval_secs.max(1);
        let ticker = Ticker::spawn("report", REPORT_TICK, false, move || {
            if producer.is_running() {
                let now = producer.advance_clock(1);
                if now.as_secs() % every == 0 {
                    producer.send_update(now);
                }
            }
            TickFlow::Continue
        })?;
        let previous = lock(&self.reporting).replace(ticker);
        drop(previous);
        tracing::info!(every_secs = every, "Reporting started");
        Ok(())
    }

    /// Stop the simulation clock. Idempotent.
    pub fn stop_reporting(&self) {
        let ticker = lock(&self.reporting).take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
            tracing::info!("Reporting stopped");
        }
    }

    /// Whether the simulation clock is running.
    pub fn is_reporting(&self) -> bool {
        lock(&self.reporting)
            .as_ref()
            .is_some_and(|ticker| !ticker.is_finished())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.disconnect();
    }
}
