//! TCP relay server: accepts one controller at a time and serves its registrations.

use anyhow::{Context, Result};
use modelsync_core::IoObserver;
use modelsync_net::{
    outbound_channel, ConnectionError, Link, LinkExit, LinkOptions, DEFAULT_READ_TIMEOUT,
};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::activity::{ActivityLog, IoFanout, TracingIoObserver};
use crate::lock;
use crate::registry::{EndpointRegistry, RegistryOptions};
use crate::writer::DEFAULT_SINK_RETRY;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address.
    pub listen: SocketAddr,
    /// Directory shared with the modeller.
    pub working_dir: PathBuf,
    /// Sink retry cadence.
    pub sink_retry: Duration,
    /// Socket receive timeout.
    pub read_timeout: Duration,
    /// Optional JSON-lines I/O activity log.
    pub activity_log: Option<PathBuf>,
}

impl RelayConfig {
    /// Defaults for everything but the address and working directory.
    pub fn new(listen: SocketAddr, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            working_dir: working_dir.into(),
            sink_retry: DEFAULT_SINK_RETRY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            activity_log: None,
        }
    }
}

struct ActiveSession {
    generation: u64,
    link: Link,
    registry: Arc<EndpointRegistry>,
}

struct RelayShared {
    options: RegistryOptions,
    read_timeout: Duration,
    io: Arc<dyn IoObserver>,
    controller_active: AtomicBool,
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
}

impl RelayShared {
    fn end_session(&self, generation: u64, exit: LinkExit) {
        let session = {
            let mut slot = lock(&self.session);
            if slot.as_ref().map(|s| s.generation) == Some(generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            let released = session.registry.reset();
            match &exit {
                LinkExit::Closed => tracing::info!(released, "Controller session closed"),
                LinkExit::Dropped(reason) => {
                    tracing::info!(released, reason = reason.as_str(), "Controller disconnected")
                }
            }
            self.controller_active.store(false, Ordering::SeqCst);
            // Dropping the link from its own reader thread skips the self-join.
            drop(session);
        }
    }
}

/// Entry point for starting relay servers.
pub struct RelayServer;

impl RelayServer {
    /// Bind and start accepting controllers on a background thread.
    pub fn start(config: RelayConfig) -> Result<RelayHandle> {
        std::fs::create_dir_all(&config.working_dir).with_context(|| {
            format!("creating working directory {}", config.working_dir.display())
        })?;

        let listener = TcpListener::bind(config.listen)
            .with_context(|| format!("binding relay listener on {}", config.listen))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let mut io = IoFanout::new().with(Arc::new(TracingIoObserver));
        if let Some(path) = &config.activity_log {
            match ActivityLog::open(path) {
                Ok(log) => io = io.with(Arc::new(log)),
                Err(err) => {
                    tracing::warn!(err = %format!("{err:#}"), path = %path.display(), "Failed to open activity log");
                }
            }
        }

        let shared = Arc::new(RelayShared {
            options: RegistryOptions {
                working_dir: config.working_dir.clone(),
                sink_retry: config.sink_retry,
            },
            read_timeout: config.read_timeout,
            io: Arc::new(io),
            controller_active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let join = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("relay-accept".to_string())
                .spawn(move || accept_loop(listener, &shared, &stop))?
        };

        tracing::info!(
            addr = %local_addr,
            working_dir = %config.working_dir.display(),
            "Relay listening"
        );
        Ok(RelayHandle {
            local_addr,
            stop,
            join: Some(join),
            shared,
        })
    }
}

/// Handle to a running relay server.
pub struct RelayHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    shared: Arc<RelayShared>,
}

impl RelayHandle {
    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether a controller is connected.
    pub fn has_controller(&self) -> bool {
        lock(&self.shared.session).is_some()
    }

    /// Live endpoints of the current session, zero without one.
    pub fn live_endpoints(&self) -> usize {
        lock(&self.shared.session)
            .as_ref()
            .map_or(0, |session| session.registry.live_count())
    }

    /// Registry of the current session.
    pub fn registry(&self) -> Option<Arc<EndpointRegistry>> {
        lock(&self.shared.session)
            .as_ref()
            .map(|session| Arc::clone(&session.registry))
    }

    /// Stop accepting, cancel every endpoint timer, then close the live link. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("Relay accept thread panicked");
            }
        }
        let session = lock(&self.shared.session).take();
        if let Some(mut session) = session {
            session.registry.reset();
            session.link.close(None);
            self.shared.controller_active.store(false, Ordering::SeqCst);
            tracing::info!("Relay shut down");
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: &Arc<RelayShared>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => handle_connection(stream, peer, shared),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                tracing::warn!(%err, "Relay accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: &Arc<RelayShared>) {
    let claimed = shared
        .controller_active
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();
    if !claimed {
        tracing::warn!(%peer, "Controller already connected; refusing");
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    if let Err(err) = start_session(stream, peer, shared) {
        tracing::warn!(%err, %peer, "Failed to start controller session");
        shared.controller_active.store(false, Ordering::SeqCst);
    }
}

fn start_session(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Arc<RelayShared>,
) -> Result<(), ConnectionError> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream
        .set_nonblocking(false)
        .map_err(ConnectionError::Stream)?;

    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (sender, outbox) = outbound_channel();
    let registry = Arc::new(EndpointRegistry::new(
        shared.options.clone(),
        Arc::new(sender),
        Arc::clone(&shared.io),
    ));

    // Hold the slot while the link starts so a fast exit cannot race the insert.
    let mut slot = lock(&shared.session);
    let link = {
        let registry = Arc::clone(&registry);
        let on_exit = Arc::clone(shared);
        Link::start(
            stream,
            outbox,
            LinkOptions {
                label: format!("relay-{generation}"),
                read_timeout: shared.read_timeout,
                ..LinkOptions::default()
            },
            move |envelope| registry.handle_envelope(envelope),
            move |exit| on_exit.end_session(generation, exit),
        )?
    };
    tracing::info!(%peer, session = generation, "Controller connected");
    *slot = Some(ActiveSession {
        generation,
        link,
        registry,
    });
    Ok(())
}
