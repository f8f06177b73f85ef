//! Transport boundary: a socket is a pair of channels.
//!
//! A [`Connector`] opens a socket for a URL and hands back a [`Socket`]:
//! outbound [`Outgoing`] frames go in one end, inbound [`Incoming`] frames
//! and the final close notification come out of the other. The WebSocket
//! implementation lives in [`websocket`]. With the `test-util` feature,
//! `memory` provides an in-process pair for tests.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use url::Url;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemoryServer, ServerConnection};
pub use websocket::WebSocketConnector;

/// Close code and reason reported when a socket ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(Self::ABNORMAL, reason)
    }
}

impl std::fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}, reason: \"{}\"", self.code, self.reason)
    }
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Vec<u8>),
    /// Start a normal close handshake.
    Close,
}

/// Server to client. `Closed` is always the last item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Frame(Vec<u8>),
    Closed(CloseInfo),
}

/// An open socket.
#[derive(Debug)]
pub struct Socket {
    pub outgoing: mpsc::UnboundedSender<Outgoing>,
    pub incoming: mpsc::UnboundedReceiver<Incoming>,
}

/// Errors raised while opening a socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// WebSocket handshake or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The remote end refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Opens sockets.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Socket, TransportError>>;
}
