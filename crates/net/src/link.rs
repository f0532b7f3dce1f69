//! Bidirectional envelope link over one TCP stream.
//!
//! Each link owns two named threads: a writer fed by a channel (the only thread that touches
//! the outbound half) and a reader that polls the socket with a bounded receive timeout so it
//! can notice cancellation.

use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{decode_envelope, encode_envelope, MAX_LINE_BYTES};
use crate::envelope::Envelope;
use crate::error::{ConnectionError, ProtocolDecodeError};
use crate::ticker::join_unless_current;

/// Receive timeout used when none is configured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Both threads running.
    Connected,
    /// A read or write failed; the link is unusable.
    Dropped,
    /// Closed on request.
    Closed,
}

struct LinkStatus(AtomicU8);

impl LinkStatus {
    const CONNECTED: u8 = 0;
    const DROPPED: u8 = 1;
    const CLOSED: u8 = 2;

    fn new() -> Self {
        Self(AtomicU8::new(Self::CONNECTED))
    }

    fn get(&self) -> LinkState {
        match self.0.load(Ordering::SeqCst) {
            Self::CONNECTED => LinkState::Connected,
            Self::DROPPED => LinkState::Dropped,
            _ => LinkState::Closed,
        }
    }

    /// Connected -> Dropped; returns whether this call made the transition.
    fn mark_dropped(&self) -> bool {
        self.0
            .compare_exchange(
                Self::CONNECTED,
                Self::DROPPED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn mark_closed(&self) {
        self.0.store(Self::CLOSED, Ordering::SeqCst);
    }
}

/// Anything that can push envelopes toward the peer.
pub trait Outbound: Send + Sync {
    /// Queue an envelope for delivery, in call order.
    fn send(&self, envelope: Envelope) -> Result<(), ConnectionError>;
}

enum Outgoing {
    Envelope(Envelope),
    Close,
}

/// Cloneable handle for queueing envelopes on a link.
///
/// Sending never blocks on the socket; the writer thread serialises and flushes.
#[derive(Clone)]
pub struct LinkSender {
    tx: Sender<Outgoing>,
    status: Arc<LinkStatus>,
}

impl LinkSender {
    /// Current transport state.
    pub fn state(&self) -> LinkState {
        self.status.get()
    }
}

impl Outbound for LinkSender {
    fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if self.status.get() != LinkState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.tx
            .send(Outgoing::Envelope(envelope))
            .map_err(|_| ConnectionError::NotConnected)
    }
}

/// Receiving half of the outbound queue, consumed by [`Link::start`].
pub struct Outbox {
    rx: Receiver<Outgoing>,
    tx: Sender<Outgoing>,
    status: Arc<LinkStatus>,
}

/// Create the outbound queue before the link exists, so handlers built ahead of
/// [`Link::start`] can already hold a sender.
pub fn outbound_channel() -> (LinkSender, Outbox) {
    let (tx, rx) = mpsc::channel();
    let status = Arc::new(LinkStatus::new());
    let sender = LinkSender {
        tx: tx.clone(),
        status: Arc::clone(&status),
    };
    (sender, Outbox { rx, tx, status })
}

/// Why the read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkExit {
    /// [`Link::close`] was called.
    Closed,
    /// The peer went away or the socket failed.
    Dropped(String),
}

/// Link tuning.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Prefix for thread names and log lines.
    pub label: String,
    /// Socket receive timeout; also bounds blocking writes.
    pub read_timeout: Duration,
    /// Longest inbound frame kept; longer ones are skipped up to their newline.
    pub max_line_bytes: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            label: "link".to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

/// A running link: one socket, one writer thread, one reader thread.
pub struct Link {
    peer: String,
    label: String,
    stream: TcpStream,
    tx: Sender<Outgoing>,
    sender: LinkSender,
    status: Arc<LinkStatus>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    /// Start both threads on `stream`.
    ///
    /// `on_envelope` runs on the reader thread for every decoded envelope; malformed frames are
    /// logged and skipped. `on_exit` runs once on the reader thread when the loop ends.
    pub fn start<F, C>(
        stream: TcpStream,
        outbox: Outbox,
        options: LinkOptions,
        mut on_envelope: F,
        on_exit: C,
    ) -> Result<Self, ConnectionError>
    where
        F: FnMut(Envelope) + Send + 'static,
        C: FnOnce(LinkExit) + Send + 'static,
    {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream
            .set_read_timeout(Some(options.read_timeout))
            .map_err(ConnectionError::Stream)?;
        stream
            .set_write_timeout(Some(options.read_timeout))
            .map_err(ConnectionError::Stream)?;
        let _ = stream.set_nodelay(true);

        let read_half = stream.try_clone().map_err(ConnectionError::Stream)?;
        let write_half = stream.try_clone().map_err(ConnectionError::Stream)?;
        let kill_half = stream.try_clone().map_err(ConnectionError::Stream)?;

        let Outbox { rx, tx, status } = outbox;
        let sender = LinkSender {
            tx: tx.clone(),
            status: Arc::clone(&status),
        };
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let status = Arc::clone(&status);
            let peer = peer.clone();
            thread::Builder::new()
                .name(format!("{}-writer", options.label))
                .spawn(move || write_loop(write_half, kill_half, rx, &status, &peer))
                .map_err(ConnectionError::Stream)?
        };

        let reader = {
            let status = Arc::clone(&status);
            let stop = Arc::clone(&stop);
            let peer = peer.clone();
            let max_line = options.max_line_bytes;
            let spawned = thread::Builder::new()
                .name(format!("{}-reader", options.label))
                .spawn(move || {
                    let exit = read_loop(read_half, &stop, &peer, max_line, &mut on_envelope);
                    if let LinkExit::Dropped(reason) = &exit {
                        if status.mark_dropped() {
                            warn!(peer = peer.as_str(), reason = reason.as_str(), "Link dropped");
                        }
                    }
                    on_exit(exit);
                });
            match spawned {
                Ok(join) => join,
                Err(err) => {
                    let _ = tx.send(Outgoing::Close);
                    return Err(ConnectionError::Stream(err));
                }
            }
        };

        info!(peer = peer.as_str(), label = options.label.as_str(), "Link established");
        Ok(Self {
            peer,
            label: options.label,
            stream,
            tx,
            sender,
            status,
            stop,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Handle for queueing envelopes.
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Current transport state.
    pub fn state(&self) -> LinkState {
        self.status.get()
    }

    /// Remote address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Stop the link. Idempotent.
    ///
    /// While still connected, `farewell` is flushed after everything already queued. Secondary
    /// close errors are ignored.
    pub fn close(&mut self, farewell: Option<Envelope>) {
        if self.reader.is_none() && self.writer.is_none() {
            return;
        }
        let was_connected = self.status.get() == LinkState::Connected;
        self.stop.store(true, Ordering::SeqCst);
        self.status.mark_closed();

        if was_connected {
            if let Some(envelope) = farewell {
                let _ = self.tx.send(Outgoing::Envelope(envelope));
            }
        }
        let _ = self.tx.send(Outgoing::Close);
        if let Some(writer) = self.writer.take() {
            join_unless_current(writer, &self.label);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            join_unless_current(reader, &self.label);
        }
        info!(peer = self.peer.as_str(), label = self.label.as_str(), "Link closed");
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close(None);
    }
}

fn write_loop(
    stream: TcpStream,
    kill: TcpStream,
    rx: Receiver<Outgoing>,
    status: &LinkStatus,
    peer: &str,
) {
    let mut writer = BufWriter::new(stream);
    while let Ok(outgoing) = rx.recv() {
        let envelope = match outgoing {
            Outgoing::Envelope(envelope) => envelope,
            Outgoing::Close => break,
        };
        let frame = match encode_envelope(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, peer, "Failed to encode envelope");
                continue;
            }
        };
        if let Err(err) = writer.write_all(&frame).and_then(|()| writer.flush()) {
            if status.mark_dropped() {
                warn!(%err, peer, "Link write failed");
            }
            // Wake the reader so it reports the drop.
            let _ = kill.shutdown(Shutdown::Both);
            return;
        }
        debug!(
            peer,
            action = %envelope.action,
            endpoint = %envelope.endpoint_id,
            bytes = frame.len(),
            "Sent envelope"
        );
    }
}

fn read_loop<F>(
    stream: TcpStream,
    stop: &AtomicBool,
    peer: &str,
    max_line: usize,
    on_envelope: &mut F,
) -> LinkExit
where
    F: FnMut(Envelope),
{
    let mut reader = BufReader::new(stream);
    // Bytes of a partially received frame survive receive timeouts.
    let mut pending: Vec<u8> = Vec::new();
    // Byte count of an over-long frame being skipped up to its newline.
    let mut skipping: Option<usize> = None;
    loop {
        if stop.load(Ordering::SeqCst) {
            return LinkExit::Closed;
        }
        let (consumed, complete) = match reader.fill_buf() {
            Ok([]) => {
                return if stop.load(Ordering::SeqCst) {
                    LinkExit::Closed
                } else {
                    LinkExit::Dropped("end of stream".to_string())
                };
            }
            Ok(buf) => {
                let (take, complete) = match buf.iter().position(|byte| *byte == b'\n') {
                    Some(at) => (at + 1, true),
                    None => (buf.len(), false),
                };
                match skipping.as_mut() {
                    Some(skipped) => *skipped += take,
                    None => pending.extend_from_slice(&buf[..take]),
                }
                (take, complete)
            }
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                return if stop.load(Ordering::SeqCst) {
                    LinkExit::Closed
                } else {
                    LinkExit::Dropped(err.to_string())
                };
            }
        };
        reader.consume(consumed);

        if skipping.is_none() && pending.len() > max_line {
            skipping = Some(pending.len());
            pending = Vec::new();
        }
        if !complete {
            continue;
        }
        if let Some(skipped) = skipping.take() {
            let err = ProtocolDecodeError::LineTooLarge(skipped);
            warn!(%err, peer, "Discarding over-long frame");
            continue;
        }
        let frame = std::mem::take(&mut pending);
        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match decode_envelope(&frame) {
            Ok(envelope) => {
                debug!(
                    peer,
                    action = %envelope.action,
                    endpoint = %envelope.endpoint_id,
                    "Received envelope"
                );
                on_envelope(envelope);
            }
            Err(err) => warn!(%err, peer, "Discarding malformed envelope"),
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Message;
    use std::net::TcpListener;
    use std::sync::mpsc::RecvTimeoutError;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    fn options(label: &str) -> LinkOptions {
        LinkOptions {
            label: label.to_string(),
            read_timeout: Duration::from_millis(50),
            max_line_bytes: 1024,
        }
    }

    fn start_recording(
        stream: TcpStream,
        label: &str,
    ) -> (Link, Receiver<Envelope>, Receiver<LinkExit>) {
        let (env_tx, env_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let (_, outbox) = outbound_channel();
        let link = Link::start(
            stream,
            outbox,
            options(label),
            move |envelope| {
                let _ = env_tx.send(envelope);
            },
            move |exit| {
                let _ = exit_tx.send(exit);
            },
        )
        .expect("link starts");
        (link, env_rx, exit_rx)
    }

    #[test]
    fn envelopes_arrive_in_order_across_timeouts() {
        let (a, b) = pair();
        let (mut left, _, _) = start_recording(a, "left");
        let (mut right, received, _) = start_recording(b, "right");

        let sender = left.sender();
        for n in 0..3 {
            sender
                .send(
                    Message::WriteFile {
                        id: "W1".into(),
                        payload: format!("P{n}"),
                    }
                    .into_envelope(),
                )
                .expect("queued");
            thread::sleep(Duration::from_millis(80));
        }

        for n in 0..3 {
            let envelope = received
                .recv_timeout(Duration::from_secs(5))
                .expect("envelope arrives");
            assert_eq!(
                envelope.message().expect("valid"),
                Message::WriteFile {
                    id: "W1".into(),
                    payload: format!("P{n}"),
                }
            );
        }
        left.close(None);
        right.close(None);
    }

    #[test]
    fn malformed_frames_do_not_end_the_link() {
        let (a, b) = pair();
        let (mut link, received, exits) = start_recording(b, "tolerant");
        let mut raw = a;
        raw.write_all(b"garbage\n{\"action\":\"RESET\"}\n")
            .expect("raw write");
        let envelope = received
            .recv_timeout(Duration::from_secs(5))
            .expect("reset arrives");
        assert_eq!(envelope.message().expect("valid"), Message::Reset);
        assert_eq!(
            exits.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
        link.close(None);
        assert_eq!(
            exits.recv_timeout(Duration::from_secs(5)).expect("exit"),
            LinkExit::Closed
        );
    }

    #[test]
    fn over_long_frames_are_skipped_without_buffering() {
        let (a, b) = pair();
        let (mut link, received, exits) = start_recording(b, "bounded");
        let mut raw = a;
        // Far past the 1 KiB limit, spread over several receive timeouts.
        let chunk = vec![b'x'; 16 * 1024];
        for _ in 0..4 {
            raw.write_all(&chunk).expect("raw write");
            thread::sleep(Duration::from_millis(60));
        }
        raw.write_all(b"\n{\"action\":\"RESET\"}\n").expect("raw write");

        let envelope = received
            .recv_timeout(Duration::from_secs(5))
            .expect("reset arrives");
        assert_eq!(envelope.message().expect("valid"), Message::Reset);
        assert!(received.try_recv().is_err());
        assert_eq!(link.state(), LinkState::Connected);
        link.close(None);
        assert_eq!(
            exits.recv_timeout(Duration::from_secs(5)).expect("exit"),
            LinkExit::Closed
        );
    }

    #[test]
    fn peer_hangup_is_reported_as_dropped() {
        let (a, b) = pair();
        let (link, _, exits) = start_recording(b, "orphan");
        drop(a);
        let exit = exits.recv_timeout(Duration::from_secs(5)).expect("exit");
        assert!(matches!(exit, LinkExit::Dropped(_)));
        assert_eq!(link.state(), LinkState::Dropped);
        assert!(matches!(
            link.sender().send(Envelope::reset()),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn close_flushes_farewell_and_is_idempotent() {
        let (a, b) = pair();
        let (mut left, _, _) = start_recording(a, "closing");
        let (mut right, received, _) = start_recording(b, "listening");
        left.close(Some(Envelope::reset()));
        left.close(Some(Envelope::reset()));
        let envelope = received
            .recv_timeout(Duration::from_secs(5))
            .expect("farewell arrives");
        assert_eq!(envelope, Envelope::reset());
        assert_eq!(left.state(), LinkState::Closed);
        right.close(None);
    }
}
