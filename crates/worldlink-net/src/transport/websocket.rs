//! WebSocket transport over `tokio-tungstenite`.

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{CloseInfo, Connector, Incoming, Outgoing, Socket, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens binary WebSocket connections (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Socket, TransportError>> {
        async move {
            let (ws, _response) = connect_async(url.as_str()).await?;
            tracing::debug!(host = url.host_str().unwrap_or_default(), "WebSocket opened");

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(ws, out_rx, in_tx));
            Ok(Socket {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
        .boxed()
    }
}

/// Shuttle frames between the channels and the stream until either side
/// closes. Always ends by sending [`Incoming::Closed`].
async fn pump(
    ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<Incoming>,
) {
    let (mut writer, mut reader) = ws.split();
    let mut closing = false;

    let info = loop {
        tokio::select! {
            item = outgoing.recv(), if !closing => match item {
                Some(Outgoing::Frame(bytes)) => {
                    if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                        break CloseInfo::abnormal(e.to_string());
                    }
                }
                // Dropping the sender counts as a close request.
                Some(Outgoing::Close) | None => {
                    closing = true;
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if writer.send(Message::Close(Some(frame))).await.is_err() {
                        break CloseInfo::normal();
                    }
                }
            },
            msg = reader.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = incoming.send(Incoming::Frame(bytes.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => CloseInfo::new(f.code.into(), f.reason.as_str()),
                        None => CloseInfo::new(CloseInfo::NO_STATUS, ""),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseInfo::abnormal(e.to_string()),
                None => break CloseInfo::abnormal("stream ended"),
            },
        }
    };

    let _ = incoming.send(Incoming::Closed(info));
}
