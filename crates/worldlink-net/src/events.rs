//! Inbound events delivered to hooks and callbacks.

use std::fmt;
use std::sync::Arc;

use crate::messages::{PacketKind, WorldPacket};

/// A frame whose kind header this client does not recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPacket {
    /// Raw wire kind.
    pub kind: u16,
    /// Undecoded body bytes.
    pub payload: Vec<u8>,
}

/// Every decoded frame, delivered to `Raw` callbacks before hooks run.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// The frame as received.
    pub bytes: Vec<u8>,
    /// What it decoded to: a packet or an unknown frame.
    pub decoded: Box<Event>,
}

/// Failure raised by a hook or callback, delivered as an error event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("handler for {kind} failed: {error}")]
pub struct HandlerFailure {
    /// Kind of the event being processed when the handler failed.
    pub kind: EventKind,
    /// The underlying error.
    pub error: Arc<anyhow::Error>,
}

impl HandlerFailure {
    pub fn new(kind: EventKind, error: anyhow::Error) -> Self {
        Self {
            kind,
            error: Arc::new(error),
        }
    }
}

/// Key used to register callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A decoded world packet of the given kind.
    Packet(PacketKind),
    /// Any frame with an unrecognised kind.
    Unknown,
    /// Every decoded frame, known or not.
    Raw,
    /// A handler failure.
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Packet(kind) => write!(f, "{kind:?}"),
            EventKind::Unknown => f.write_str("Unknown"),
            EventKind::Raw => f.write_str("Raw"),
            EventKind::Error => f.write_str("Error"),
        }
    }
}

impl From<PacketKind> for EventKind {
    fn from(kind: PacketKind) -> Self {
        EventKind::Packet(kind)
    }
}

/// Something that happened on the connection.
#[derive(Debug, Clone)]
pub enum Event {
    Packet(WorldPacket),
    Unknown(UnknownPacket),
    Raw(RawFrame),
    Error(HandlerFailure),
}

impl Event {
    /// The registration key callbacks for this event are stored under.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Packet(packet) => EventKind::Packet(packet.kind()),
            Event::Unknown(_) => EventKind::Unknown,
            Event::Raw(_) => EventKind::Raw,
            Event::Error(_) => EventKind::Error,
        }
    }

    /// The packet, if this is a packet event.
    pub fn packet(&self) -> Option<&WorldPacket> {
        match self {
            Event::Packet(packet) => Some(packet),
            _ => None,
        }
    }
}

impl From<WorldPacket> for Event {
    fn from(packet: WorldPacket) -> Self {
        Event::Packet(packet)
    }
}
