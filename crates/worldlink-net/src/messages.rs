//! World packets and their binary wire encoding.
//!
//! Every frame on the socket is a single binary message:
//!
//! ```text
//! +-----------+---------------+----------------------+
//! | version   | kind          | body                 |
//! | u8        | u16 LE        | postcard payload     |
//! +-----------+---------------+----------------------+
//! ```
//!
//! The kind header is read before the body so that a kind this client does
//! not know about surfaces as [`Event::Unknown`] instead of a decode error.

use serde::{Deserialize, Serialize};

use crate::events::{Event, UnknownPacket};

/// Current wire-protocol version. First byte of every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Version byte plus the two kind bytes.
const HEADER_LEN: usize = 3;

// ---------------------------------------------------------------------------
// PacketKind
// ---------------------------------------------------------------------------

/// Wire discriminant of a [`WorldPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PacketKind {
    /// Server confirms the session and describes the joining player.
    PlayerInit = 1,
    /// Client acknowledges the init packet.
    PlayerInitReceived = 2,
    /// Keep-alive. Sent by the server, echoed by the client.
    Ping = 3,
    /// Chat line.
    PlayerChat = 4,
    /// Another player entered the world.
    PlayerJoined = 5,
    /// A player left the world.
    PlayerLeft = 6,
    /// A player moved.
    PlayerMoved = 7,
    /// One or more blocks were placed.
    WorldBlockPlaced = 8,
    /// Server-originated notice.
    SystemMessage = 9,
}

impl PacketKind {
    /// Every known kind, in wire order.
    pub const ALL: [PacketKind; 9] = [
        PacketKind::PlayerInit,
        PacketKind::PlayerInitReceived,
        PacketKind::Ping,
        PacketKind::PlayerChat,
        PacketKind::PlayerJoined,
        PacketKind::PlayerLeft,
        PacketKind::PlayerMoved,
        PacketKind::WorldBlockPlaced,
        PacketKind::SystemMessage,
    ];

    /// Look up a kind by its wire id.
    pub fn from_wire(raw: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_id() == raw)
    }

    /// The id written into the frame header.
    pub fn wire_id(self) -> u16 {
        self as u16
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Public profile of a player in the world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerProperties {
    /// In-world player id (not stable across joins).
    pub player_id: u32,
    /// Account id.
    pub account_id: String,
    /// Display name.
    pub username: String,
    /// Smiley face id.
    pub face: u32,
    /// Whether the account is a site administrator.
    pub is_admin: bool,
    /// Whether the player owns the world. Owners get higher rate limits.
    pub is_world_owner: bool,
}

/// First meaningful frame after the socket opens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerInit {
    /// The joining player's own properties.
    pub properties: PlayerProperties,
    /// World identifier.
    pub world_id: String,
    /// World width in blocks.
    pub world_width: u32,
    /// World height in blocks.
    pub world_height: u32,
}

/// Chat line. `player_id` is ignored by the server on outbound packets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerChat {
    /// Sender.
    pub player_id: u32,
    /// Message text.
    pub message: String,
}

/// Another player entered the world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerJoined {
    /// The new player's properties.
    pub properties: PlayerProperties,
}

/// A player left the world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerLeft {
    /// Player that left.
    pub player_id: u32,
}

/// Player movement update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerMoved {
    /// Player that moved.
    pub player_id: u32,
    /// X position in pixels.
    pub x: f64,
    /// Y position in pixels.
    pub y: f64,
}

/// Block coordinate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockPosition {
    pub x: i32,
    pub y: i32,
}

/// Block placement. Outbound packets leave `player_id` at zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldBlockPlaced {
    /// Player that placed the blocks.
    pub player_id: u32,
    /// Layer (0 = background, 1 = foreground).
    pub layer: u8,
    /// Every position receiving the block.
    pub positions: Vec<BlockPosition>,
    /// Block id from the palette.
    pub block_id: u32,
}

/// Server notice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMessage {
    pub title: String,
    pub message: String,
    /// Whether the client should show it as a modal dialog.
    pub is_dialog: bool,
}

// ---------------------------------------------------------------------------
// WorldPacket
// ---------------------------------------------------------------------------

/// A decoded world packet. The variant is the kind; the payload follows.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldPacket {
    PlayerInit(PlayerInit),
    PlayerInitReceived,
    Ping,
    PlayerChat(PlayerChat),
    PlayerJoined(PlayerJoined),
    PlayerLeft(PlayerLeft),
    PlayerMoved(PlayerMoved),
    WorldBlockPlaced(WorldBlockPlaced),
    SystemMessage(SystemMessage),
}

impl WorldPacket {
    /// Wire kind of this packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            WorldPacket::PlayerInit(_) => PacketKind::PlayerInit,
            WorldPacket::PlayerInitReceived => PacketKind::PlayerInitReceived,
            WorldPacket::Ping => PacketKind::Ping,
            WorldPacket::PlayerChat(_) => PacketKind::PlayerChat,
            WorldPacket::PlayerJoined(_) => PacketKind::PlayerJoined,
            WorldPacket::PlayerLeft(_) => PacketKind::PlayerLeft,
            WorldPacket::PlayerMoved(_) => PacketKind::PlayerMoved,
            WorldPacket::WorldBlockPlaced(_) => PacketKind::WorldBlockPlaced,
            WorldPacket::SystemMessage(_) => PacketKind::SystemMessage,
        }
    }

    /// Convenience constructor for an outbound chat line.
    pub fn chat(message: impl Into<String>) -> Self {
        WorldPacket::PlayerChat(PlayerChat {
            player_id: 0,
            message: message.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame was empty (no version byte).
    #[error("empty frame, no version byte")]
    Empty,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The frame ended inside the header.
    #[error("frame truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    /// Postcard (de)serialization of the body failed.
    #[error("payload error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Encode a packet into a complete frame.
pub fn encode_packet(packet: &WorldPacket) -> Result<Vec<u8>, CodecError> {
    let body = match packet {
        WorldPacket::PlayerInit(p) => postcard::to_allocvec(p)?,
        WorldPacket::PlayerInitReceived | WorldPacket::Ping => Vec::new(),
        WorldPacket::PlayerChat(p) => postcard::to_allocvec(p)?,
        WorldPacket::PlayerJoined(p) => postcard::to_allocvec(p)?,
        WorldPacket::PlayerLeft(p) => postcard::to_allocvec(p)?,
        WorldPacket::PlayerMoved(p) => postcard::to_allocvec(p)?,
        WorldPacket::WorldBlockPlaced(p) => postcard::to_allocvec(p)?,
        WorldPacket::SystemMessage(p) => postcard::to_allocvec(p)?,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&packet.kind().wire_id().to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame into an inbound [`Event`].
///
/// Unknown kinds are not an error: they become [`Event::Unknown`] carrying
/// the raw body.
pub fn decode_frame(data: &[u8]) -> Result<Event, CodecError> {
    let Some((&version, rest)) = data.split_first() else {
        return Err(CodecError::Empty);
    };
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let [lo, hi, body @ ..] = rest else {
        return Err(CodecError::Truncated(data.len()));
    };

    let raw_kind = u16::from_le_bytes([*lo, *hi]);
    let Some(kind) = PacketKind::from_wire(raw_kind) else {
        return Ok(Event::Unknown(UnknownPacket {
            kind: raw_kind,
            payload: body.to_vec(),
        }));
    };

    let packet = match kind {
        PacketKind::PlayerInit => WorldPacket::PlayerInit(postcard::from_bytes(body)?),
        PacketKind::PlayerInitReceived => WorldPacket::PlayerInitReceived,
        PacketKind::Ping => WorldPacket::Ping,
        PacketKind::PlayerChat => WorldPacket::PlayerChat(postcard::from_bytes(body)?),
        PacketKind::PlayerJoined => WorldPacket::PlayerJoined(postcard::from_bytes(body)?),
        PacketKind::PlayerLeft => WorldPacket::PlayerLeft(postcard::from_bytes(body)?),
        PacketKind::PlayerMoved => WorldPacket::PlayerMoved(postcard::from_bytes(body)?),
        PacketKind::WorldBlockPlaced => {
            WorldPacket::WorldBlockPlaced(postcard::from_bytes(body)?)
        }
        PacketKind::SystemMessage => WorldPacket::SystemMessage(postcard::from_bytes(body)?),
    };
    Ok(Event::Packet(packet))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
