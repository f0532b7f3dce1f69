//! Controller-side session: one link to the relay, id assignment and inbound routing.

use modelsync_core::{ConnectionObserver, ConnectionState, EndpointId, EndpointKind};
use modelsync_net::{
    outbound_channel, ConnectionError, Envelope, Link, LinkExit, LinkOptions, Message, Outbound,
    SyncError, TargetFile, DEFAULT_READ_TIMEOUT,
};
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::{lock, read_lock, write_lock};

/// Receives `READ_FILE` payloads for one registered source.
pub trait SourceHandler: Send + Sync {
    /// Called on the read-loop thread for every payload, in poll order.
    fn on_payload(&self, payload: &str);
}

impl<F> SourceHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_payload(&self, payload: &str) {
        self(payload)
    }
}

/// Where and how to reach the relay.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay host name or address.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Bound on establishing the socket.
    pub connect_timeout: Duration,
    /// Socket receive timeout.
    pub read_timeout: Duration,
}

impl SessionConfig {
    /// Defaults for everything but the address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(3),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

struct SessionInner {
    observer: Arc<dyn ConnectionObserver>,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<(u64, Link)>>,
    routes: RwLock<HashMap<EndpointId, Arc<dyn SourceHandler>>>,
    generation: AtomicU64,
}

impl SessionInner {
    /// Store `state`; returns whether it differs from the previous one.
    fn swap_state(&self, state: ConnectionState) -> bool {
        let mut current = lock(&self.state);
        let changed = *current != state;
        *current = state;
        changed
    }

    fn notify(&self, state: ConnectionState) {
        tracing::info!(?state, "Connection state changed");
        self.observer.on_connection_state_changed(state);
    }

    fn set_state(&self, state: ConnectionState) {
        if self.swap_state(state) {
            self.notify(state);
        }
    }

    fn route(&self, envelope: Envelope) {
        let message = match envelope.message() {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%err, endpoint = %envelope.endpoint_id, "Discarding invalid message");
                return;
            }
        };
        match message {
            Message::ReadFile { id, payload } => {
                let handler = read_lock(&self.routes).get(&id).cloned();
                match handler {
                    Some(handler) => handler.on_payload(&payload),
                    None => tracing::debug!(endpoint = %id, "Payload for unknown endpoint discarded"),
                }
            }
            Message::Reset => {
                tracing::info!("Relay requested reset");
                write_lock(&self.routes).clear();
            }
            other => {
                tracing::warn!(action = %other.action(), "Unexpected message from relay ignored");
            }
        }
    }

    fn link_ended(&self, generation: u64, exit: LinkExit) {
        let LinkExit::Dropped(reason) = exit else {
            return;
        };
        let link = {
            let mut slot = lock(&self.link);
            match slot.as_ref() {
                Some((current, _)) if *current == generation => slot.take(),
                _ => None,
            }
        };
        if let Some((_, link)) = link {
            write_lock(&self.routes).clear();
            tracing::warn!(reason = reason.as_str(), peer = link.peer(), "Session dropped");
            drop(link);
            self.set_state(ConnectionState::Dropped);
        }
    }

    fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        let sender = lock(&self.link)
            .as_ref()
            .map(|(_, link)| link.sender())
            .ok_or(ConnectionError::NotConnected)?;
        sender.send(envelope)
    }
}

/// One controller session.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Session {
    config: SessionConfig,
    inner: Arc<SessionInner>,
    next_source: AtomicU64,
    next_sink: AtomicU64,
}

impl Session {
    /// Disconnected session reporting state changes to `observer`.
    pub fn new(config: SessionConfig, observer: Arc<dyn ConnectionObserver>) -> Self {
        Self {
            config,
            inner: Arc::new(SessionInner {
                observer,
                state: Mutex::new(ConnectionState::Unknown),
                link: Mutex::new(None),
                routes: RwLock::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
            next_source: AtomicU64::new(0),
            next_sink: AtomicU64::new(0),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Whether a link is live.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    /// Report an application-level state (loading progress) upward.
    pub fn report_state(&self, state: ConnectionState) {
        self.inner.set_state(state);
    }

    /// Open the link and reset both sides. A no-op while connected.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Connecting);
        let stream = match self.open_stream() {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, "Relay unreachable");
                self.inner.set_state(ConnectionState::Unreachable);
                return Err(err);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, outbox) = outbound_channel();
        // Queued ahead of everything else on the new link.
        sender.send(Envelope::reset())?;
        write_lock(&self.inner.routes).clear();

        let mut slot = lock(&self.inner.link);
        let link = {
            let on_envelope = Arc::clone(&self.inner);
            let on_exit = Arc::clone(&self.inner);
            Link::start(
                stream,
                outbox,
                LinkOptions {
                    label: format!("controller-{generation}"),
                    read_timeout: self.config.read_timeout,
                    ..LinkOptions::default()
                },
                move |envelope| on_envelope.route(envelope),
                move |exit| on_exit.link_ended(generation, exit),
            )
        };
        match link {
            Ok(link) => {
                // Recorded under the slot lock so a fast drop is always ordered after it.
                let changed = self.inner.swap_state(ConnectionState::Connected);
                *slot = Some((generation, link));
                drop(slot);
                if changed {
                    self.inner.notify(ConnectionState::Connected);
                }
                Ok(())
            }
            Err(err) => {
                drop(slot);
                self.inner.set_state(ConnectionState::Unreachable);
                Err(err)
            }
        }
    }

    fn open_stream(&self) -> Result<TcpStream, ConnectionError> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        let addrs = target
            .to_socket_addrs()
            .map_err(|_| ConnectionError::Resolve(target.clone()))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    tracing::info!(%addr, "Connected to relay");
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(source) => ConnectionError::Connect {
                addr: target,
                source,
            },
            None => ConnectionError::Resolve(target),
        })
    }

    /// Send a final reset while connected, then close the link. Idempotent.
    pub fn disconnect(&self) {
        let link = lock(&self.inner.link).take();
        write_lock(&self.inner.routes).clear();
        if let Some((_, mut link)) = link {
            link.close(Some(Envelope::reset()));
        }
        if self.state() != ConnectionState::Unknown {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }

    /// Drop every endpoint on both sides, keeping the link.
    pub fn reset(&self) -> Result<(), ConnectionError> {
        write_lock(&self.inner.routes).clear();
        self.inner.send(Envelope::reset())
    }

    /// Register a source polling `target` every `interval_secs`; payloads go to `handler`.
    pub fn register_source(
        &self,
        target: &str,
        interval_secs: u64,
        handler: Arc<dyn SourceHandler>,
    ) -> Result<EndpointId, SyncError> {
        let target = TargetFile::new(target)?;
        let id = self.next_id(EndpointKind::Source);
        let message = Message::RegisterSource {
            id: id.clone(),
            interval_secs: interval_secs.max(1),
            target,
        };
        // Routed before sending so the first poll cannot race the route.
        write_lock(&self.inner.routes).insert(id.clone(), handler);
        if let Err(err) = self.inner.send(message.into_envelope()) {
            write_lock(&self.inner.routes).remove(&id);
            return Err(err.into());
        }
        tracing::info!(endpoint = %id, interval_secs, "Source registration sent");
        Ok(id)
    }

    /// Register a sink writing `target`.
    pub fn register_sink(&self, target: &str) -> Result<EndpointId, SyncError> {
        let target = TargetFile::new(target)?;
        let id = self.next_id(EndpointKind::Sink);
        self.inner.send(
            Message::RegisterSink {
                id: id.clone(),
                target,
            }
            .into_envelope(),
        )?;
        tracing::info!(endpoint = %id, "Sink registration sent");
        Ok(id)
    }

    /// Drop endpoint `id` on both sides.
    pub fn unregister(&self, id: &EndpointId) -> Result<(), ConnectionError> {
        write_lock(&self.inner.routes).remove(id);
        self.inner
            .send(Message::Unregister { id: id.clone() }.into_envelope())
    }

    /// Queue `payload` for sink `id`.
    pub fn write(&self, id: &EndpointId, payload: String) -> Result<(), ConnectionError> {
        self.inner.send(
            Message::WriteFile {
                id: id.clone(),
                payload,
            }
            .into_envelope(),
        )
    }

    /// Number of routed sources.
    pub fn routed_sources(&self) -> usize {
        read_lock(&self.inner.routes).len()
    }

    fn next_id(&self, kind: EndpointKind) -> EndpointId {
        let counter = match kind {
            EndpointKind::Source => &self.next_source,
            EndpointKind::Sink => &self.next_sink,
        };
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        EndpointId::new(format!("{}{n}", kind.id_prefix()))
    }
}

impl Outbound for Session {
    fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        self.inner.send(envelope)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
