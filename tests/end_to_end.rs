//! Controller and relay talking over loopback TCP, with a simulated modeller on the working
//! directory.

use modelsync_controller::{Controller, ControllerConfig, ControllerObservers};
use modelsync_core::{ConnectionState, NetworkStatus};
use modelsync_relay::{RelayConfig, RelayHandle, RelayServer};
use modelsync_testkit::{consume_file, init_test_tracing, modeler_write, wait_until, Recorder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn start_relay(dir: &Path) -> RelayHandle {
    init_test_tracing();
    let mut config = RelayConfig::new("127.0.0.1:0".parse().expect("addr"), dir);
    config.sink_retry = Duration::from_millis(100);
    config.read_timeout = Duration::from_millis(100);
    RelayServer::start(config).expect("relay starts")
}

fn controller_config(relay: &RelayHandle) -> ControllerConfig {
    let mut config = ControllerConfig::new("127.0.0.1", relay.local_addr().port());
    config.session.read_timeout = Duration::from_millis(100);
    config.snapshot_file = "out.xml".to_string();
    config.status_file = "in.xml".to_string();
    config.status_interval_secs = 1;
    config
}

/// Consumes a sink file the way the modeller does, keeping every non-empty document.
struct Consumer {
    stop: Arc<AtomicBool>,
    seen: Recorder<String>,
    thread: Option<JoinHandle<()>>,
}

impl Consumer {
    fn spawn(path: PathBuf) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Recorder::new();
        let thread = {
            let stop = Arc::clone(&stop);
            let seen = seen.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if path.exists() {
                        if let Ok(content) = consume_file(&path) {
                            if !content.is_empty() {
                                seen.push(content);
                            }
                        }
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            })
        };
        Self {
            stop,
            seen,
            thread: Some(thread),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn snapshot_reaches_modeller_and_status_reaches_simulator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let relay = start_relay(dir.path());

    let statuses: Recorder<(NetworkStatus, u32)> = Recorder::new();
    let status_sink = statuses.clone();
    let states: Recorder<ConnectionState> = Recorder::new();
    let controller = Controller::new(
        controller_config(&relay),
        ControllerObservers {
            connection: Arc::new(states.callback()),
            status: Arc::new(move |status: NetworkStatus, id: u32| status_sink.push((status, id))),
            ..ControllerObservers::default()
        },
    );
    controller.connect().expect("connects");
    assert_eq!(controller.snapshot_sink().map(|id| id.to_string()), Some("W1".to_string()));
    assert!(wait_until(Duration::from_secs(5), || relay.live_endpoints() == 3));

    let registry = relay.registry().expect("active session");
    assert!(registry.contains(&"W1".into()));
    assert!(registry.contains(&"R1".into()));

    let consumer = Consumer::spawn(dir.path().join("out.xml"));
    controller.load_network(7);
    controller.start_simulation();

    assert!(wait_until(Duration::from_secs(2), || {
        consumer.seen.snapshot().iter().any(|document| {
            document.contains("<Network_ID>7</Network_ID>")
                && document.contains("<Simulation>TRUE</Simulation>")
        })
    }));
    let first = consumer.seen.snapshot().first().cloned().expect("load snapshot");
    assert!(first.contains("<Simulation>FALSE</Simulation>"));

    modeler_write(
        &dir.path().join("in.xml"),
        "<Paramics><Network_Status>LOADED</Network_Status><Network_ID>7</Network_ID></Paramics>",
    )
    .expect("modeller writes status");
    assert!(statuses.wait_for_len(1, Duration::from_millis(1500)));
    assert_eq!(statuses.snapshot(), vec![(NetworkStatus::Loaded, 7)]);
    assert!(controller.producer().is_network_loaded());
    assert_eq!(states.last(), Some(ConnectionState::Loaded));
    // The source file is consumed on read.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("in.xml")).expect("in.xml"),
        ""
    );
}

#[test]
fn controller_reconnects_after_disconnect_with_a_fresh_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let relay = start_relay(dir.path());
    let controller = Controller::new(controller_config(&relay), ControllerObservers::default());

    controller.connect().expect("connects");
    assert!(wait_until(Duration::from_secs(5), || relay.live_endpoints() == 3));

    controller.disconnect();
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(wait_until(Duration::from_secs(5), || !relay.has_controller()));
    assert_eq!(relay.live_endpoints(), 0);

    controller.connect().expect("reconnects");
    assert!(wait_until(Duration::from_secs(5), || relay.live_endpoints() == 3));
    let registry = relay.registry().expect("active session");
    // Identifiers keep counting across connections.
    assert!(registry.contains(&"W2".into()));
    assert!(!registry.contains(&"W1".into()));
    assert_eq!(controller.snapshot_sink().map(|id| id.to_string()), Some("W2".to_string()));
}

#[test]
fn second_connect_does_not_duplicate_relay_endpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let relay = start_relay(dir.path());
    let controller = Controller::new(controller_config(&relay), ControllerObservers::default());

    controller.connect().expect("connects");
    assert!(wait_until(Duration::from_secs(5), || relay.live_endpoints() == 3));
    controller.connect().expect("second connect");
    thread::sleep(Duration::from_millis(300));

    assert_eq!(relay.live_endpoints(), 3);
    assert_eq!(controller.session().routed_sources(), 2);
    let registry = relay.registry().expect("active session");
    assert!(registry.contains(&"W1".into()));
    assert!(!registry.contains(&"W2".into()));
}

#[test]
fn relay_shutdown_drops_the_controller() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut relay = start_relay(dir.path());
    let states: Recorder<ConnectionState> = Recorder::new();
    let controller = Controller::new(
        controller_config(&relay),
        ControllerObservers {
            connection: Arc::new(states.callback()),
            ..ControllerObservers::default()
        },
    );
    controller.connect().expect("connects");
    assert!(wait_until(Duration::from_secs(5), || relay.has_controller()));

    relay.shutdown();
    assert!(wait_until(Duration::from_secs(5), || {
        controller.state() == ConnectionState::Dropped
    }));
    assert!(!controller.session().is_connected());
    assert_eq!(states.last(), Some(ConnectionState::Dropped));
    controller.load_network(1);
    assert!(!controller.send_update(modelsync_core::SimTime(1)));
}
