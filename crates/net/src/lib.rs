#![warn(missing_docs)]
//! Wire protocol shared by the controller and the relay.

pub mod codec;
pub mod document;
pub mod envelope;
pub mod error;
pub mod link;
pub mod ticker;

pub use codec::{decode_envelope, encode_envelope, MAX_LINE_BYTES};
pub use document::{parse_document, parse_fragment, DocumentError, Element, MAX_DEPTH};
pub use envelope::{Action, Child, Envelope, Message, TargetFile};
pub use error::{
    ConnectionError, EndpointIoError, ProtocolDecodeError, RegistrationError, SyncError,
};
pub use link::{
    outbound_channel, Link, LinkExit, LinkOptions, LinkSender, LinkState, Outbound, Outbox,
    DEFAULT_READ_TIMEOUT,
};
pub use ticker::{TickFlow, Ticker};
