//! World client networking: connection lifecycle, rate-limited sends, and
//! the hook/callback dispatch pipeline for inbound packets.

pub mod bucket;
pub mod client;
pub mod credentials;
pub mod error;
pub mod events;
pub mod messages;
pub mod pipeline;
pub mod reconnection;
pub mod session;
pub mod settings;
pub mod transport;

pub use bucket::TokenBucket;
pub use client::GameClient;
pub use credentials::{FixedJoinKey, JoinKeyProvider, join_url};
pub use error::{CredentialError, JoinError};
pub use events::{Event, EventKind, HandlerFailure, RawFrame, UnknownPacket};
pub use messages::{CodecError, PacketKind, WorldPacket, decode_frame, encode_packet};
pub use pipeline::{
    Callback, CallbackRef, DispatchError, DispatchPipeline, Dispatched, Flow, Hook, HookState,
};
pub use reconnection::{AttemptWindow, ReconnectPolicy};
pub use session::{ConnectionSession, ConnectionStateWatch, Reconnect, SessionState};
pub use settings::{ClientSettings, DEFAULT_GAME_WS, HandledPacket, RateLimits};
pub use transport::{CloseInfo, Connector, TransportError, WebSocketConnector};
