//! Error taxonomy for the synchronisation protocol.
//!
//! Transport failures (`ConnectionError`) end the session; everything else is contained by the
//! endpoint or message that raised it.

use modelsync_core::EndpointId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::document::DocumentError;

/// The socket could not be established or maintained.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Opening the stream failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialled.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// The host name did not resolve to any address.
    #[error("no address found for {0}")]
    Resolve(String),
    /// Configuring or cloning the stream failed.
    #[error("failed to set up stream: {0}")]
    Stream(#[source] io::Error),
    /// The session has no live link.
    #[error("not connected")]
    NotConnected,
}

/// A single file operation on an endpoint failed.
#[derive(Debug, Error)]
#[error("endpoint {endpoint} failed on {}: {source}", path.display())]
pub struct EndpointIoError {
    /// Endpoint that owns the file.
    pub endpoint: EndpointId,
    /// File being accessed.
    pub path: PathBuf,
    /// Underlying I/O error.
    #[source]
    pub source: io::Error,
}

impl EndpointIoError {
    /// Attach endpoint context to an I/O error.
    pub fn new(endpoint: &EndpointId, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            endpoint: endpoint.clone(),
            path: path.into(),
            source,
        }
    }
}

/// A malformed envelope or payload; the message is dropped, the session stays healthy.
#[derive(Debug, Error)]
pub enum ProtocolDecodeError {
    /// The frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    /// The frame exceeded the maximum line length.
    #[error("frame of {0} bytes exceeds the line limit")]
    LineTooLarge(usize),
    /// The frame did not hold a well-formed envelope.
    #[error("invalid envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// An endpoint action arrived without an endpoint id.
    #[error("{0} requires an endpoint id")]
    MissingEndpointId(&'static str),
    /// The children did not match the shape required by the action.
    #[error("malformed {action} children: {detail}")]
    MalformedChildren {
        /// Action being decoded.
        action: &'static str,
        /// What was wrong.
        detail: String,
    },
    /// A registered file path escaped the working directory.
    #[error("target file `{0}` must be a relative path inside the working directory")]
    InvalidTarget(String),
    /// A text payload failed to parse as a document.
    #[error("invalid document payload: {0}")]
    Document(#[from] DocumentError),
}

/// A registration could not be honoured.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The id is already bound to a live endpoint.
    #[error("endpoint {0} is already registered")]
    Conflict(EndpointId),
    /// Creating or resetting the endpoint file failed.
    #[error(transparent)]
    Io(#[from] EndpointIoError),
    /// The poll or retry timer could not be started.
    #[error("failed to start timer for endpoint {endpoint}: {source}")]
    Timer {
        /// Endpoint whose timer failed.
        endpoint: EndpointId,
        /// Thread spawn error.
        #[source]
        source: io::Error,
    },
}

/// Umbrella error for callers that do not distinguish the layers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Endpoint file failure.
    #[error(transparent)]
    EndpointIo(#[from] EndpointIoError),
    /// Decode failure.
    #[error(transparent)]
    Decode(#[from] ProtocolDecodeError),
    /// Registration failure.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}
