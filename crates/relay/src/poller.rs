//! Source endpoints: poll a modeller-written file and forward new content.

use modelsync_core::{EndpointId, IoActivity, IoDirection, IoObserver};
use modelsync_net::{EndpointIoError, Message, Outbound, RegistrationError, TickFlow, Ticker};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Change detection state for one source file.
#[derive(Debug)]
pub struct SourceFile {
    id: EndpointId,
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl SourceFile {
    /// Bind to `path`, creating it empty if absent. Existing content is kept for the first check.
    pub fn open(id: EndpointId, path: PathBuf) -> Result<Self, EndpointIoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EndpointIoError::new(&id, parent, err))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| EndpointIoError::new(&id, &path, err))?;
        Ok(Self {
            id,
            path,
            last_seen: None,
        })
    }

    /// Endpoint id.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Polled file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One poll step.
    ///
    /// Returns the drained content when the file changed since the last check and was not
    /// empty. The file is truncated after reading and its post-truncation mtime is remembered,
    /// so the truncation itself never counts as a change.
    pub fn check(&mut self) -> Result<Option<String>, EndpointIoError> {
        let modified = self.modified()?;
        if self.last_seen == Some(modified) {
            return Ok(None);
        }

        let bytes = fs::read(&self.path).map_err(|err| self.io_error(err))?;
        if bytes.is_empty() {
            self.last_seen = Some(modified);
            return Ok(None);
        }

        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|err| self.io_error(err))?;
        self.last_seen = Some(self.modified()?);

        Ok(Some(self.decode(bytes)))
    }

    fn decode(&self, bytes: Vec<u8>) -> String {
        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(
                    endpoint = %self.id,
                    path = %self.path.display(),
                    valid_up_to = err.utf8_error().valid_up_to(),
                    "Source content is not valid UTF-8; invalid bytes replaced"
                );
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        }
    }

    fn modified(&self) -> Result<SystemTime, EndpointIoError> {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|err| self.io_error(err))
    }

    fn io_error(&self, err: io::Error) -> EndpointIoError {
        EndpointIoError::new(&self.id, &self.path, err)
    }
}

/// A running source endpoint.
pub struct FilePoller {
    id: EndpointId,
    path: PathBuf,
    ticker: Ticker,
}

impl FilePoller {
    /// Open the file and start polling every `interval`, with an immediate first check.
    ///
    /// Content is forwarded as `READ_FILE` through `outbound`. I/O errors are logged and the
    /// tick is skipped; the poller keeps its schedule.
    pub fn start(
        id: EndpointId,
        path: PathBuf,
        interval: Duration,
        outbound: Arc<dyn Outbound>,
        io: Arc<dyn IoObserver>,
    ) -> Result<Self, RegistrationError> {
        let mut source = SourceFile::open(id.clone(), path.clone())?;
        let ticker = Ticker::spawn(format!("poll-{id}"), interval, true, move || {
            poll_once(&mut source, outbound.as_ref(), io.as_ref());
            TickFlow::Continue
        })
        .map_err(|source| RegistrationError::Timer {
            endpoint: id.clone(),
            source,
        })?;
        tracing::info!(
            endpoint = %id,
            path = %path.display(),
            interval_ms = interval.as_millis() as u64,
            "Source registered"
        );
        Ok(Self { id, path, ticker })
    }

    /// Endpoint id.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Polled file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cancel polling and wait for an in-flight check. Idempotent.
    pub fn stop(&mut self) {
        self.ticker.stop();
    }
}

fn poll_once(source: &mut SourceFile, outbound: &dyn Outbound, io: &dyn IoObserver) {
    let content = match source.check() {
        Ok(Some(content)) => content,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(%err, endpoint = %source.id(), "Source poll failed");
            return;
        }
    };

    let bytes = content.len();
    io.on_io_activity(&IoActivity::now(
        source.id().clone(),
        IoDirection::FileRead,
        bytes,
    ));
    let message = Message::ReadFile {
        id: source.id().clone(),
        payload: content,
    };
    match outbound.send(message.into_envelope()) {
        Ok(()) => tracing::debug!(endpoint = %source.id(), bytes, "Forwarded source content"),
        Err(err) => tracing::warn!(%err, endpoint = %source.id(), bytes, "Dropped source content"),
    }
}
