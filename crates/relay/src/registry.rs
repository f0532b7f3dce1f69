//! Relay-side endpoint table, driven by registration traffic from the controller.

use modelsync_core::{EndpointId, EndpointKind, IoObserver};
use modelsync_net::{Envelope, Message, Outbound, RegistrationError, TargetFile};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock;
use crate::poller::FilePoller;
use crate::writer::{FileRelayWriter, DEFAULT_SINK_RETRY};

/// A live endpoint.
pub enum Endpoint {
    /// Polls a modeller-written file.
    Source(FilePoller),
    /// Writes a modeller-read file.
    Sink(FileRelayWriter),
}

impl Endpoint {
    /// Endpoint kind.
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Source(_) => EndpointKind::Source,
            Endpoint::Sink(_) => EndpointKind::Sink,
        }
    }

    /// Endpoint id.
    pub fn id(&self) -> &EndpointId {
        match self {
            Endpoint::Source(poller) => poller.id(),
            Endpoint::Sink(writer) => writer.id(),
        }
    }

    /// Bound file.
    pub fn path(&self) -> &Path {
        match self {
            Endpoint::Source(poller) => poller.path(),
            Endpoint::Sink(writer) => writer.path(),
        }
    }

    /// Cancel the endpoint's timer.
    pub fn stop(&mut self) {
        match self {
            Endpoint::Source(poller) => poller.stop(),
            Endpoint::Sink(writer) => writer.stop(),
        }
    }
}

/// Where and how endpoints touch the file system.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Directory every target file is resolved against.
    pub working_dir: PathBuf,
    /// Sink retry cadence.
    pub sink_retry: Duration,
}

impl RegistryOptions {
    /// Options rooted at `working_dir` with the default retry cadence.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            sink_retry: DEFAULT_SINK_RETRY,
        }
    }
}

/// Endpoint table for one controller session.
pub struct EndpointRegistry {
    options: RegistryOptions,
    outbound: Arc<dyn Outbound>,
    io: Arc<dyn IoObserver>,
    endpoints: Mutex<HashMap<EndpointId, Endpoint>>,
}

impl EndpointRegistry {
    /// Empty registry; sources forward their content through `outbound`.
    pub fn new(
        options: RegistryOptions,
        outbound: Arc<dyn Outbound>,
        io: Arc<dyn IoObserver>,
    ) -> Self {
        Self {
            options,
            outbound,
            io,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Decode and apply one inbound envelope. Failures are logged and contained.
    pub fn handle_envelope(&self, envelope: Envelope) {
        let action = envelope.action;
        match envelope.message() {
            Ok(message) => self.handle(message),
            Err(err) => {
                tracing::warn!(%err, %action, endpoint = %envelope.endpoint_id, "Discarding invalid message");
            }
        }
    }

    /// Apply one message. Failures are logged and contained.
    pub fn handle(&self, message: Message) {
        match message {
            Message::RegisterSource {
                id,
                interval_secs,
                target,
            } => {
                let interval = Duration::from_secs(interval_secs);
                if let Err(err) = self.register_source(id.clone(), interval, &target) {
                    log_registration_failure(&id, &err);
                }
            }
            Message::RegisterSink { id, target } => {
                if let Err(err) = self.register_sink(id.clone(), &target) {
                    log_registration_failure(&id, &err);
                }
            }
            Message::Unregister { id } => {
                self.unregister(&id);
            }
            Message::WriteFile { id, payload } => self.write(&id, payload),
            Message::ReadFile { id, .. } => {
                tracing::warn!(endpoint = %id, "READ_FILE is relay-to-controller only; ignored");
            }
            Message::Reset => {
                let released = self.reset();
                tracing::info!(released, "Registry reset");
            }
        }
    }

    /// Start polling `target` every `interval`.
    pub fn register_source(
        &self,
        id: EndpointId,
        interval: Duration,
        target: &TargetFile,
    ) -> Result<(), RegistrationError> {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.contains_key(&id) {
            return Err(RegistrationError::Conflict(id));
        }
        let poller = FilePoller::start(
            id.clone(),
            target.resolve(&self.options.working_dir),
            interval,
            Arc::clone(&self.outbound),
            Arc::clone(&self.io),
        )?;
        endpoints.insert(id, Endpoint::Source(poller));
        Ok(())
    }

    /// Bind a sink to `target`, clearing the file.
    pub fn register_sink(
        &self,
        id: EndpointId,
        target: &TargetFile,
    ) -> Result<(), RegistrationError> {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.contains_key(&id) {
            return Err(RegistrationError::Conflict(id));
        }
        let writer = FileRelayWriter::open(
            id.clone(),
            target.resolve(&self.options.working_dir),
            self.options.sink_retry,
            Arc::clone(&self.io),
        )?;
        endpoints.insert(id, Endpoint::Sink(writer));
        Ok(())
    }

    /// Stop and release `id`. Unknown ids are a logged no-op; returns whether one was removed.
    pub fn unregister(&self, id: &EndpointId) -> bool {
        let removed = lock(&self.endpoints).remove(id);
        match removed {
            Some(mut endpoint) => {
                endpoint.stop();
                tracing::info!(endpoint = %id, kind = ?endpoint.kind(), "Endpoint unregistered");
                true
            }
            None => {
                tracing::debug!(endpoint = %id, "Unregister for unknown endpoint ignored");
                false
            }
        }
    }

    /// Route a payload to sink `id`.
    pub fn write(&self, id: &EndpointId, payload: String) {
        let endpoints = lock(&self.endpoints);
        match endpoints.get(id) {
            Some(Endpoint::Sink(writer)) => writer.accept(payload),
            Some(Endpoint::Source(_)) => {
                tracing::warn!(endpoint = %id, "WRITE_FILE addressed to a source; ignored");
            }
            None => tracing::debug!(endpoint = %id, "WRITE_FILE for unknown endpoint discarded"),
        }
    }

    /// Stop and release every endpoint; returns how many were live.
    pub fn reset(&self) -> usize {
        let drained: Vec<Endpoint> = lock(&self.endpoints).drain().map(|(_, e)| e).collect();
        let released = drained.len();
        for mut endpoint in drained {
            endpoint.stop();
        }
        released
    }

    /// Number of live endpoints.
    pub fn live_count(&self) -> usize {
        lock(&self.endpoints).len()
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &EndpointId) -> bool {
        lock(&self.endpoints).contains_key(id)
    }

    /// Kind of endpoint `id`, if live.
    pub fn kind_of(&self, id: &EndpointId) -> Option<EndpointKind> {
        lock(&self.endpoints).get(id).map(Endpoint::kind)
    }

    /// Pending payload count of sink `id`, if it is a live sink.
    pub fn pending_len(&self, id: &EndpointId) -> Option<usize> {
        match lock(&self.endpoints).get(id) {
            Some(Endpoint::Sink(writer)) => Some(writer.pending_len()),
            _ => None,
        }
    }

    /// Working directory endpoints resolve against.
    pub fn working_dir(&self) -> &Path {
        &self.options.working_dir
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        self.reset();
    }
}

fn log_registration_failure(id: &EndpointId, err: &RegistrationError) {
    match err {
        RegistrationError::Conflict(_) => {
            tracing::warn!(%err, endpoint = %id, "Registration conflict; existing endpoint kept");
        }
        _ => tracing::warn!(%err, endpoint = %id, "Registration failed"),
    }
}
