//! Wire envelope exchanged between controller and relay, plus its validated message view.

use modelsync_core::{EndpointId, EndpointKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolDecodeError;

/// Protocol action carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Create an endpoint.
    Register,
    /// Destroy an endpoint.
    Unregister,
    /// Source content travelling relay -> controller.
    ReadFile,
    /// Sink content travelling controller -> relay.
    WriteFile,
    /// Destroy every endpoint on both sides.
    Reset,
}

impl Action {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Register => "REGISTER",
            Action::Unregister => "UNREGISTER",
            Action::ReadFile => "READ_FILE",
            Action::WriteFile => "WRITE_FILE",
            Action::Reset => "RESET",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered child of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Child {
    /// Poll cadence in seconds (sources only).
    Interval(u64),
    /// File path relative to the relay working directory.
    TargetFile(String),
    /// Opaque text blob.
    Payload(String),
}

/// One protocol message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target endpoint; empty for session control.
    #[serde(default)]
    pub endpoint_id: EndpointId,
    /// What to do.
    pub action: Action,
    /// Action-specific children in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Child>,
}

impl Envelope {
    /// Session-wide reset.
    pub fn reset() -> Self {
        Message::Reset.into_envelope()
    }

    /// Validate into a typed message.
    pub fn message(&self) -> Result<Message, ProtocolDecodeError> {
        Message::try_from(self.clone())
    }
}

/// Registered file path, guaranteed relative and free of parent references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetFile(String);

impl TargetFile {
    /// Validate a raw path.
    pub fn new(raw: impl Into<String>) -> Result<Self, ProtocolDecodeError> {
        let raw = raw.into();
        let path = Path::new(&raw);
        let relative = path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
            && path
                .components()
                .any(|component| matches!(component, Component::Normal(_)));
        if relative {
            Ok(Self(raw))
        } else {
            Err(ProtocolDecodeError::InvalidTarget(raw))
        }
    }

    /// Raw path as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute location inside `working_dir`.
    pub fn resolve(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.0)
    }
}

impl fmt::Display for TargetFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Register a polling source.
    RegisterSource {
        /// New endpoint id.
        id: EndpointId,
        /// Poll cadence in seconds, always positive.
        interval_secs: u64,
        /// File to poll.
        target: TargetFile,
    },
    /// Register a writing sink.
    RegisterSink {
        /// New endpoint id.
        id: EndpointId,
        /// File to write.
        target: TargetFile,
    },
    /// Drop an endpoint.
    Unregister {
        /// Endpoint to drop.
        id: EndpointId,
    },
    /// Content read from a source file.
    ReadFile {
        /// Source that produced the content.
        id: EndpointId,
        /// File content.
        payload: String,
    },
    /// Content to write to a sink file.
    WriteFile {
        /// Destination sink.
        id: EndpointId,
        /// File content.
        payload: String,
    },
    /// Drop every endpoint.
    Reset,
}

impl Message {
    /// Action this message travels as.
    pub fn action(&self) -> Action {
        match self {
            Message::RegisterSource { .. } | Message::RegisterSink { .. } => Action::Register,
            Message::Unregister { .. } => Action::Unregister,
            Message::ReadFile { .. } => Action::ReadFile,
            Message::WriteFile { .. } => Action::WriteFile,
            Message::Reset => Action::Reset,
        }
    }

    /// Endpoint kind created by a registration.
    pub fn registered_kind(&self) -> Option<EndpointKind> {
        match self {
            Message::RegisterSource { .. } => Some(EndpointKind::Source),
            Message::RegisterSink { .. } => Some(EndpointKind::Sink),
            _ => None,
        }
    }

    /// Build the wire envelope.
    pub fn into_envelope(self) -> Envelope {
        let action = self.action();
        let (endpoint_id, children) = match self {
            Message::RegisterSource {
                id,
                interval_secs,
                target,
            } => (
                id,
                vec![Child::Interval(interval_secs), Child::TargetFile(target.0)],
            ),
            Message::RegisterSink { id, target } => (id, vec![Child::TargetFile(target.0)]),
            Message::Unregister { id } => (id, Vec::new()),
            Message::ReadFile { id, payload } | Message::WriteFile { id, payload } => {
                (id, vec![Child::Payload(payload)])
            }
            Message::Reset => (EndpointId::control(), Vec::new()),
        };
        Envelope {
            endpoint_id,
            action,
            children,
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        message.into_envelope()
    }
}

impl TryFrom<Envelope> for Message {
    type Error = ProtocolDecodeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope {
            endpoint_id,
            action,
            children,
        } = envelope;

        if action == Action::Reset {
            return Ok(Message::Reset);
        }
        if endpoint_id.is_control() {
            return Err(ProtocolDecodeError::MissingEndpointId(action.as_str()));
        }

        let malformed = |detail: &str| ProtocolDecodeError::MalformedChildren {
            action: action.as_str(),
            detail: detail.to_string(),
        };

        let mut children = children.into_iter();
        let message = match action {
            Action::Register => match (children.next(), children.next()) {
                (Some(Child::Interval(interval_secs)), Some(Child::TargetFile(target))) => {
                    if interval_secs == 0 {
                        return Err(malformed("interval must be positive"));
                    }
                    Message::RegisterSource {
                        id: endpoint_id,
                        interval_secs,
                        target: TargetFile::new(target)?,
                    }
                }
                (Some(Child::TargetFile(target)), None) => Message::RegisterSink {
                    id: endpoint_id,
                    target: TargetFile::new(target)?,
                },
                _ => return Err(malformed("expected [interval, target_file] or [target_file]")),
            },
            Action::Unregister => Message::Unregister { id: endpoint_id },
            Action::ReadFile | Action::WriteFile => {
                let Some(Child::Payload(payload)) = children.next() else {
                    return Err(malformed("expected a single payload"));
                };
                if action == Action::ReadFile {
                    Message::ReadFile {
                        id: endpoint_id,
                        payload,
                    }
                } else {
                    Message::WriteFile {
                        id: endpoint_id,
                        payload,
                    }
                }
            }
            Action::Reset => Message::Reset,
        };

        if children.next().is_some() {
            return Err(malformed("unexpected trailing children"));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(raw: &str) -> TargetFile {
        TargetFile::new(raw).expect("valid target")
    }

    #[test]
    fn source_registration_carries_interval_then_target() {
        let envelope = Message::RegisterSource {
            id: "R1".into(),
            interval_secs: 1,
            target: target("in.xml"),
        }
        .into_envelope();
        assert_eq!(envelope.action, Action::Register);
        assert_eq!(
            envelope.children,
            vec![Child::Interval(1), Child::TargetFile("in.xml".into())]
        );
    }

    #[test]
    fn sink_registration_carries_only_target() {
        let message = Envelope {
            endpoint_id: "W1".into(),
            action: Action::Register,
            children: vec![Child::TargetFile("out.xml".into())],
        }
        .message()
        .expect("sink registration");
        assert_eq!(message.registered_kind(), Some(EndpointKind::Sink));
    }

    #[test]
    fn reset_ignores_endpoint_id() {
        let envelope = Envelope::reset();
        assert!(envelope.endpoint_id.is_control());
        assert_eq!(envelope.message().expect("reset"), Message::Reset);
    }

    #[test]
    fn endpoint_actions_require_id() {
        let envelope = Envelope {
            endpoint_id: EndpointId::control(),
            action: Action::Unregister,
            children: Vec::new(),
        };
        assert!(matches!(
            envelope.message(),
            Err(ProtocolDecodeError::MissingEndpointId("UNREGISTER"))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let envelope = Envelope {
            endpoint_id: "R1".into(),
            action: Action::Register,
            children: vec![Child::Interval(0), Child::TargetFile("in.xml".into())],
        };
        assert!(matches!(
            envelope.message(),
            Err(ProtocolDecodeError::MalformedChildren { .. })
        ));
    }

    #[test]
    fn write_without_payload_is_rejected() {
        let envelope = Envelope {
            endpoint_id: "W1".into(),
            action: Action::WriteFile,
            children: vec![Child::TargetFile("out.xml".into())],
        };
        assert!(envelope.message().is_err());
    }

    #[test]
    fn targets_must_stay_inside_working_dir() {
        assert!(TargetFile::new("status/in.xml").is_ok());
        assert!(TargetFile::new("./in.xml").is_ok());
        assert!(TargetFile::new("/etc/passwd").is_err());
        assert!(TargetFile::new("../escape.xml").is_err());
        assert!(TargetFile::new("").is_err());
        assert!(TargetFile::new(".").is_err());
    }
}
