use bytes::Bytes;
use futures::{future::BoxFuture, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use relayio_engine::Packet;

use crate::errors::ClientError;

/// Dials the server and yields a fresh [`Conn`]. The manager calls it for
/// the initial open and again for every reconnection attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Conn, ClientError>>;
}

/// The default connector: a direct WebSocket connection to the server's
/// engine endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `url` is the full engine endpoint, e.g.
    /// `ws://localhost:3000/socket.io/?EIO=4&transport=websocket`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Conn, ClientError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws, _) = connect_async(url).await?;
            Ok(Conn::Ws(Box::new(ws)))
        })
    }
}

/// One live connection carrying engine packets.
pub enum Conn {
    /// A WebSocket connection to a real server.
    Ws(Box<WebSocketStream<MaybeTlsStream<TcpStream>>>),
    /// An in-process pipe, used by tests and embedded setups.
    Pipe {
        tx: mpsc::Sender<Packet>,
        rx: mpsc::Receiver<Packet>,
    },
}

/// The far end of a piped [`Conn`]: what the "server" reads and writes.
pub struct PipeEnd {
    pub tx: mpsc::Sender<Packet>,
    pub rx: mpsc::Receiver<Packet>,
}

impl Conn {
    /// A connected in-process pair: the client half and the server half.
    pub fn pipe(buffer: usize) -> (Conn, PipeEnd) {
        let (client_tx, server_rx) = mpsc::channel(buffer);
        let (server_tx, client_rx) = mpsc::channel(buffer);
        (
            Conn::Pipe {
                tx: client_tx,
                rx: client_rx,
            },
            PipeEnd {
                tx: server_tx,
                rx: server_rx,
            },
        )
    }

    pub async fn send(&mut self, packet: Packet) -> Result<(), ClientError> {
        match self {
            Conn::Ws(ws) => {
                let msg = match packet {
                    Packet::Binary(data) => Message::Binary(data.to_vec()),
                    packet => {
                        let packet: String = packet.try_into()?;
                        Message::Text(packet)
                    }
                };
                ws.send(msg).await?;
                Ok(())
            }
            Conn::Pipe { tx, .. } => tx
                .send(packet)
                .await
                .map_err(|_| ClientError::Disconnected),
        }
    }

    /// The next packet, `None` once the connection is over.
    pub async fn recv(&mut self) -> Option<Result<Packet, ClientError>> {
        match self {
            Conn::Ws(ws) => loop {
                match ws.next().await? {
                    Ok(Message::Text(msg)) => {
                        return Some(Packet::try_from(msg.as_str()).map_err(ClientError::from))
                    }
                    Ok(Message::Binary(data)) => {
                        return Some(Ok(Packet::Binary(Bytes::from(data))))
                    }
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("ws read error: {}", e);
                        return Some(Err(ClientError::from(e)));
                    }
                }
            },
            Conn::Pipe { rx, .. } => rx.recv().await.map(Ok),
        }
    }
}
