//! In-process transport. The test harness plays the server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{CloseInfo, Connector, Incoming, Outgoing, Socket, TransportError};
use crate::events::Event;
use crate::messages::{WorldPacket, decode_frame, encode_packet};

/// Create a connected connector/server pair.
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        accept: accept_tx,
        attempts: Arc::new(AtomicUsize::new(0)),
        refuse: Arc::new(AtomicBool::new(false)),
        urls: Arc::new(Mutex::new(Vec::new())),
    };
    let server = MemoryServer { accept: accept_rx };
    (connector, server)
}

/// Client side. Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<ServerConnection>,
    attempts: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    urls: Arc<Mutex<Vec<Url>>>,
}

impl MemoryConnector {
    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse every connection while set.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every URL a connection was attempted to.
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Socket, TransportError>> {
        async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(url.clone());
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Refused(url.to_string()));
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (server_tx, server_rx) = mpsc::unbounded_channel();

            let connection = ServerConnection {
                url: url.clone(),
                to_client: in_tx.clone(),
                from_client: server_rx,
            };
            self.accept
                .send(connection)
                .map_err(|_| TransportError::Refused("memory server dropped".to_string()))?;

            tokio::spawn(pump(out_rx, server_tx, in_tx));
            Ok(Socket {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
        .boxed()
    }
}

async fn pump(
    mut from_client: mpsc::UnboundedReceiver<Outgoing>,
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    to_client: mpsc::UnboundedSender<Incoming>,
) {
    loop {
        tokio::select! {
            item = from_client.recv() => match item {
                Some(Outgoing::Frame(bytes)) => {
                    if to_server.send(bytes).is_err() {
                        let _ = to_client.send(Incoming::Closed(CloseInfo::abnormal("server gone")));
                        return;
                    }
                }
                Some(Outgoing::Close) => {
                    let _ = to_client.send(Incoming::Closed(CloseInfo::normal()));
                    return;
                }
                None => return,
            },
            _ = to_server.closed() => {
                let _ = to_client.send(Incoming::Closed(CloseInfo::abnormal("server dropped connection")));
                return;
            }
        }
    }
}

/// Accepts connections made through the paired [`MemoryConnector`].
pub struct MemoryServer {
    accept: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MemoryServer {
    /// Next accepted connection, or `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept.recv().await
    }

    /// An already accepted connection, without waiting.
    pub fn try_accept(&mut self) -> Option<ServerConnection> {
        self.accept.try_recv().ok()
    }
}

/// Server end of one in-memory socket. Dropping it drops the connection.
pub struct ServerConnection {
    pub url: Url,
    to_client: mpsc::UnboundedSender<Incoming>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ServerConnection {
    pub fn send_packet(&self, packet: &WorldPacket) {
        if let Ok(bytes) = encode_packet(packet) {
            self.send_raw(bytes);
        }
    }

    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(Incoming::Frame(bytes));
    }

    /// Close with the given code and reason.
    pub fn close(self, info: CloseInfo) {
        let _ = self.to_client.send(Incoming::Closed(info));
    }

    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.from_client.recv().await
    }

    /// Next decodable packet from the client, skipping anything else.
    pub async fn recv_packet(&mut self) -> Option<WorldPacket> {
        while let Some(bytes) = self.from_client.recv().await {
            if let Ok(Event::Packet(packet)) = decode_frame(&bytes) {
                return Some(packet);
            }
        }
        None
    }

    /// Packet already received, without waiting.
    pub fn try_recv_packet(&mut self) -> Option<WorldPacket> {
        while let Ok(bytes) = self.from_client.try_recv() {
            if let Ok(Event::Packet(packet)) = decode_frame(&bytes) {
                return Some(packet);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://memory.test/ws").unwrap()
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut server) = pair();
        let mut socket = connector.connect(&url()).await.unwrap();
        let mut conn = server.accept().await.unwrap();

        let frame = encode_packet(&WorldPacket::chat("hello")).unwrap();
        socket.outgoing.send(Outgoing::Frame(frame)).unwrap();
        assert_eq!(conn.recv_packet().await, Some(WorldPacket::chat("hello")));

        conn.send_packet(&WorldPacket::Ping);
        let Some(Incoming::Frame(bytes)) = socket.incoming.recv().await else {
            panic!("expected a frame");
        };
        assert!(matches!(decode_frame(&bytes), Ok(Event::Packet(WorldPacket::Ping))));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(connector.urls(), vec![url()]);
    }

    #[tokio::test]
    async fn test_client_close_reports_normal_closure() {
        let (connector, mut server) = pair();
        let mut socket = connector.connect(&url()).await.unwrap();
        let _conn = server.accept().await.unwrap();

        socket.outgoing.send(Outgoing::Close).unwrap();
        assert_eq!(
            socket.incoming.recv().await,
            Some(Incoming::Closed(CloseInfo::normal()))
        );
    }

    #[tokio::test]
    async fn test_server_close_carries_code_and_reason() {
        let (connector, mut server) = pair();
        let mut socket = connector.connect(&url()).await.unwrap();
        let conn = server.accept().await.unwrap();

        conn.close(CloseInfo::new(4003, "banned"));
        assert_eq!(
            socket.incoming.recv().await,
            Some(Incoming::Closed(CloseInfo::new(4003, "banned")))
        );
    }

    #[tokio::test]
    async fn test_refused_connection_still_counts() {
        let (connector, _server) = pair();
        connector.set_refuse(true);
        assert!(matches!(
            connector.connect(&url()).await,
            Err(TransportError::Refused(_))
        ));
        assert_eq!(connector.attempts(), 1);
    }
}
