//! Sink endpoints: write controller payloads into a modeller-read file, one at a time.
//!
//! The file is *available* when its mtime differs from the mtime recorded after our own last
//! write, i.e. the modeller has consumed it. Payloads that arrive while the file is unavailable
//! (or while older payloads are still queued) wait in a FIFO drained by a retry ticker.

use modelsync_core::{EndpointId, IoActivity, IoDirection, IoObserver};
use modelsync_net::{EndpointIoError, RegistrationError, TickFlow, Ticker};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::lock;

/// Retry cadence used when none is configured.
pub const DEFAULT_SINK_RETRY: Duration = Duration::from_secs(2);

/// Consecutive failures between two error-level reports.
const ESCALATE_EVERY: u32 = 5;

struct SinkState {
    queue: VecDeque<String>,
    last_written: Option<SystemTime>,
    last_written_len: u64,
    failures: u32,
    retry_active: bool,
    retry: Option<Ticker>,
    stopped: bool,
}

struct SinkShared {
    id: EndpointId,
    path: PathBuf,
    retry_period: Duration,
    io: Arc<dyn IoObserver>,
    state: Mutex<SinkState>,
}

/// A running sink endpoint.
pub struct FileRelayWriter {
    shared: Arc<SinkShared>,
}

impl FileRelayWriter {
    /// Bind to `path`, deleting and recreating it empty so the first write is always available.
    pub fn open(
        id: EndpointId,
        path: PathBuf,
        retry_period: Duration,
        io: Arc<dyn IoObserver>,
    ) -> Result<Self, RegistrationError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EndpointIoError::new(&id, parent, err))?;
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EndpointIoError::new(&id, &path, err).into()),
        }
        fs::File::create(&path).map_err(|err| EndpointIoError::new(&id, &path, err))?;

        tracing::info!(endpoint = %id, path = %path.display(), "Sink registered");
        Ok(Self {
            shared: Arc::new(SinkShared {
                id,
                path,
                retry_period,
                io,
                state: Mutex::new(SinkState {
                    queue: VecDeque::new(),
                    last_written: None,
                    last_written_len: 0,
                    failures: 0,
                    retry_active: false,
                    retry: None,
                    stopped: false,
                }),
            }),
        })
    }

    /// Endpoint id.
    pub fn id(&self) -> &EndpointId {
        &self.shared.id
    }

    /// Written file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Hand over one payload; written now if nothing is queued and the file is available,
    /// queued otherwise. Never drops the payload while the sink is live.
    pub fn accept(&self, payload: String) {
        let mut state = lock(&self.shared.state);
        if state.stopped {
            tracing::warn!(endpoint = %self.shared.id, "Payload for stopped sink discarded");
            return;
        }
        if !state.queue.is_empty() {
            state.queue.push_back(payload);
            tracing::debug!(
                endpoint = %self.shared.id,
                pending = state.queue.len(),
                "Payload queued behind backlog"
            );
            self.shared.ensure_retry(&self.shared, &mut state);
            return;
        }

        match self.shared.is_available(&state) {
            Ok(true) => match self.shared.write(&mut state, &payload) {
                Ok(()) => return,
                Err(err) => self.shared.note_failure(&mut state, &err),
            },
            Ok(false) => {
                tracing::debug!(endpoint = %self.shared.id, "Sink busy, payload queued");
            }
            Err(err) => self.shared.note_failure(&mut state, &err),
        }
        state.queue.push_back(payload);
        self.shared.ensure_retry(&self.shared, &mut state);
    }

    /// One retry pass: write the head of the queue if the file is available.
    ///
    /// Returns the number of payloads still pending.
    pub fn flush_pending(&self) -> usize {
        let mut state = lock(&self.shared.state);
        self.shared.retry_once(&mut state);
        state.queue.len()
    }

    /// Number of queued payloads.
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// Cancel the retry timer. Queued payloads are released with the endpoint. Idempotent.
    pub fn stop(&self) {
        let retry = {
            let mut state = lock(&self.shared.state);
            state.stopped = true;
            state.retry_active = false;
            if !state.queue.is_empty() {
                tracing::info!(
                    endpoint = %self.shared.id,
                    pending = state.queue.len(),
                    "Sink stopped with undelivered payloads"
                );
            }
            state.retry.take()
        };
        // Joined outside the lock; a tick in flight may be waiting for it.
        drop(retry);
    }
}

impl Drop for FileRelayWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SinkShared {
    fn is_available(&self, state: &SinkState) -> Result<bool, EndpointIoError> {
        let Some(last_written) = state.last_written else {
            return Ok(true);
        };
        match fs::metadata(&self.path).and_then(|meta| Ok((meta.modified()?, meta.len()))) {
            // An emptied file counts as consumed even when the clearing landed in the same
            // mtime tick as our write.
            Ok((modified, len)) => {
                Ok(modified != last_written || (len == 0 && state.last_written_len > 0))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(EndpointIoError::new(&self.id, &self.path, err)),
        }
    }

    fn write(&self, state: &mut SinkState, payload: &str) -> Result<(), EndpointIoError> {
        fs::write(&self.path, payload)
            .and_then(|()| fs::metadata(&self.path))
            .and_then(|meta| meta.modified())
            .map(|modified| {
                state.last_written = Some(modified);
                state.last_written_len = payload.len() as u64;
            })
            .map_err(|err| EndpointIoError::new(&self.id, &self.path, err))?;

        if state.failures > 0 {
            tracing::info!(
                endpoint = %self.id,
                failures = state.failures,
                "Sink write recovered"
            );
        }
        state.failures = 0;
        tracing::debug!(endpoint = %self.id, bytes = payload.len(), "Payload written");
        self.io.on_io_activity(&IoActivity::now(
            self.id.clone(),
            IoDirection::FileWrite,
            payload.len(),
        ));
        Ok(())
    }

    fn note_failure(&self, state: &mut SinkState, err: &EndpointIoError) {
        state.failures += 1;
        if state.failures == 1 {
            tracing::warn!(%err, endpoint = %self.id, "Sink write failed, will retry");
        } else if state.failures % ESCALATE_EVERY == 0 {
            tracing::error!(
                %err,
                endpoint = %self.id,
                failures = state.failures,
                pending = state.queue.len(),
                "Sink write keeps failing"
            );
        } else {
            tracing::debug!(%err, endpoint = %self.id, failures = state.failures, "Sink write failed");
        }
    }

    fn retry_once(&self, state: &mut SinkState) {
        let Some(head) = state.queue.front().cloned() else {
            return;
        };
        match self.is_available(state) {
            Ok(true) => match self.write(state, &head) {
                Ok(()) => {
                    state.queue.pop_front();
                }
                Err(err) => self.note_failure(state, &err),
            },
            Ok(false) => {}
            Err(err) => self.note_failure(state, &err),
        }
    }

    fn ensure_retry(&self, this: &Arc<SinkShared>, state: &mut SinkState) {
        if state.retry_active {
            return;
        }
        let shared = Arc::clone(this);
        let spawned = Ticker::spawn(
            format!("retry-{}", self.id),
            self.retry_period,
            false,
            move || shared.retry_tick(),
        );
        match spawned {
            Ok(ticker) => {
                state.retry_active = true;
                // The previous ticker already returned Stop; joining it is immediate.
                state.retry = Some(ticker);
            }
            Err(source) => {
                let err = RegistrationError::Timer {
                    endpoint: self.id.clone(),
                    source,
                };
                tracing::error!(%err, "Sink retry timer unavailable; backlog waits for next payload");
            }
        }
    }

    fn retry_tick(&self) -> TickFlow {
        let mut state = lock(&self.state);
        if state.stopped {
            state.retry_active = false;
            return TickFlow::Stop;
        }
        self.retry_once(&mut state);
        if state.queue.is_empty() {
            state.retry_active = false;
            TickFlow::Stop
        } else {
            TickFlow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelsync_testkit::{consume_file, wait_until};

    fn sink(dir: &Path, retry: Duration) -> FileRelayWriter {
        FileRelayWriter::open(
            EndpointId::from("W1"),
            dir.join("out.xml"),
            retry,
            Arc::new(|_: &IoActivity| {}),
        )
        .expect("sink opens")
    }

    fn contents(writer: &FileRelayWriter) -> String {
        fs::read_to_string(writer.path()).expect("sink file readable")
    }

    #[test]
    fn registration_clears_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("out.xml"), "stale").expect("seed");
        let writer = sink(dir.path(), DEFAULT_SINK_RETRY);
        assert_eq!(contents(&writer), "");
    }

    #[test]
    fn first_write_is_immediate_second_waits_for_consumption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_secs(3600));

        writer.accept("P1".to_string());
        assert_eq!(contents(&writer), "P1");
        assert_eq!(writer.pending_len(), 0);

        writer.accept("P2".to_string());
        assert_eq!(contents(&writer), "P1");
        assert_eq!(writer.pending_len(), 1);

        assert_eq!(writer.flush_pending(), 1);
        assert_eq!(contents(&writer), "P1");

        consume_file(writer.path()).expect("consume");
        assert_eq!(writer.flush_pending(), 0);
        assert_eq!(contents(&writer), "P2");
    }

    #[test]
    fn emptied_file_is_available_within_the_same_mtime_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_secs(3600));
        writer.accept("P1".to_string());
        writer.accept("P2".to_string());
        assert_eq!(writer.pending_len(), 1);

        // The modeller clears the file without moving its mtime.
        let written = fs::metadata(writer.path())
            .and_then(|meta| meta.modified())
            .expect("mtime");
        let file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(writer.path())
            .expect("truncate");
        file.set_modified(written).expect("restore mtime");
        drop(file);

        assert_eq!(writer.flush_pending(), 0);
        assert_eq!(contents(&writer), "P2");
    }

    #[test]
    fn empty_payload_still_waits_for_an_mtime_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_secs(3600));
        writer.accept(String::new());
        writer.accept("P2".to_string());
        assert_eq!(writer.pending_len(), 1);
        assert_eq!(contents(&writer), "");
    }

    #[test]
    fn retry_ticker_flushes_after_consumption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_millis(20));
        writer.accept("P1".to_string());
        writer.accept("P2".to_string());
        assert_eq!(writer.pending_len(), 1);

        consume_file(writer.path()).expect("consume");
        assert!(wait_until(Duration::from_secs(5), || writer.pending_len() == 0));
        assert_eq!(contents(&writer), "P2");
    }

    #[test]
    fn backlog_is_delivered_in_arrival_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_millis(20));
        for payload in ["P1", "P2", "P3"] {
            writer.accept(payload.to_string());
        }

        let mut observed = vec![contents(&writer)];
        while observed.len() < 3 {
            consume_file(writer.path()).expect("consume");
            let previous = observed.len();
            assert!(wait_until(Duration::from_secs(5), || {
                writer.pending_len() == 3 - previous - 1
            }));
            observed.push(contents(&writer));
        }
        assert_eq!(observed, vec!["P1", "P2", "P3"]);
    }

    #[test]
    fn failed_writes_keep_the_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_secs(3600));
        // Replace the file with a directory so writes fail.
        fs::remove_file(writer.path()).expect("remove");
        fs::create_dir(writer.path()).expect("block path");

        writer.accept("P1".to_string());
        assert_eq!(writer.pending_len(), 1);
        for _ in 0..6 {
            assert_eq!(writer.flush_pending(), 1);
        }

        fs::remove_dir(writer.path()).expect("unblock path");
        assert_eq!(writer.flush_pending(), 0);
        assert_eq!(contents(&writer), "P1");
    }

    #[test]
    fn stopped_sink_discards_new_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = sink(dir.path(), Duration::from_millis(20));
        writer.stop();
        writer.accept("late".to_string());
        assert_eq!(contents(&writer), "");
        assert_eq!(writer.pending_len(), 0);
    }
}
