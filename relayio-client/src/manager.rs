use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use relayio::packet::{Packet, PacketData};
use relayio_engine::{Packet as EnginePacket, Sid};

use crate::{
    backoff::Backoff,
    errors::ClientError,
    socket::Socket,
    transport::{Conn, Connector},
};

/// Tuning of one [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Whether to reconnect automatically after a lost connection.
    /// Defaults to true.
    pub reconnection: bool,
    /// Reconnection attempt cap; `None` retries forever.
    pub reconnection_attempts: Option<u32>,
    /// Base delay of the exponential backoff. Defaults to 1 second.
    pub reconnection_delay: Duration,
    /// Delay cap of the backoff. Defaults to 5 seconds.
    pub reconnection_delay_max: Duration,
    /// Jitter factor of the backoff, in `[0, 1]`. Defaults to 0.5.
    pub randomization_factor: f64,
    /// Deadline of emitted acknowledgements. Defaults to 5 seconds.
    pub ack_timeout: Duration,
    /// With a value above zero, pending acks survive a reconnect instead
    /// of failing at disconnect time. Defaults to 0.
    pub retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnection: true,
            reconnection_attempts: None,
            reconnection_delay: Duration::from_secs(1),
            reconnection_delay_max: Duration::from_secs(5),
            randomization_factor: 0.5,
            ack_timeout: Duration::from_secs(5),
            retries: 0,
        }
    }
}

/// Lifecycle notifications, observed through [`Manager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The engine handshake completed.
    Connect,
    /// The connection was lost or closed.
    Disconnect,
    /// A reconnection attempt is starting (1-based).
    ReconnectAttempt(u32),
    /// The attempt cap was reached; the manager gives up.
    ReconnectFailed,
}

#[derive(Default)]
struct ManagerState {
    sid: Option<Sid>,
    open: bool,
    opening: bool,
    closing: bool,
    /// A binary packet whose attachments have not all arrived yet.
    partial_bin_packet: Option<Packet<'static>>,
}

/// The client-side session manager.
///
/// Owns the engine session: performs the handshake, answers the server's
/// heartbeat, demultiplexes the messaging layer to per-namespace
/// [`Socket`]s, and schedules reconnections with exponential backoff when
/// the connection drops. The outgoing write buffer lives on the manager, so
/// packets accepted before a transport died are carried over to the next
/// connection.
pub struct Manager {
    connector: Box<dyn Connector>,
    config: ManagerConfig,
    out_tx: mpsc::UnboundedSender<EnginePacket>,
    out_rx: AsyncMutex<mpsc::UnboundedReceiver<EnginePacket>>,
    sockets: Mutex<HashMap<Cow<'static, str>, Arc<Socket>>>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ManagerEvent>,
    backoff: Mutex<Backoff>,
}

impl Manager {
    pub fn new(connector: impl Connector, config: ManagerConfig) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let backoff = Backoff::new(
            config.reconnection_delay,
            config.reconnection_delay_max,
            config.randomization_factor,
            config.reconnection_attempts,
        );
        Arc::new(Self {
            connector: Box::new(connector),
            config,
            out_tx,
            out_rx: AsyncMutex::new(out_rx),
            sockets: Mutex::new(HashMap::new()),
            state: Mutex::new(ManagerState::default()),
            events,
            backoff: Mutex::new(backoff),
        })
    }

    /// The socket for a namespace, created on first use. Sockets share the
    /// manager's engine session.
    pub fn socket(self: &Arc<Self>, ns: impl Into<Cow<'static, str>>) -> Arc<Socket> {
        let ns = ns.into();
        self.sockets
            .lock()
            .unwrap()
            .entry(ns.clone())
            .or_insert_with(|| {
                Arc::new(Socket::new(
                    ns,
                    self.out_tx.clone(),
                    self.config.ack_timeout,
                    self.config.retries,
                ))
            })
            .clone()
    }

    /// Opens the connection: dials, reads the OPEN handshake, starts the
    /// connection task and joins every registered namespace.
    ///
    /// Errors with [`ClientError::AlreadyOpen`] while a connection is live
    /// or being established.
    pub async fn open(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.open || state.opening {
                return Err(ClientError::AlreadyOpen);
            }
            state.opening = true;
            state.closing = false;
        }
        let res = self.open_inner().await;
        if res.is_err() {
            self.state.lock().unwrap().opening = false;
        }
        res
    }

    async fn open_inner(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut conn = self.connector.connect().await?;

        let open = match conn.recv().await {
            Some(Ok(EnginePacket::Open(open))) => open,
            Some(Err(e)) => return Err(e),
            _ => return Err(ClientError::BadHandshake),
        };
        debug!("[sid={}] handshake complete", open.sid);
        {
            let mut state = self.state.lock().unwrap();
            state.sid = Some(open.sid);
            state.open = true;
            state.opening = false;
        }
        self.backoff.lock().unwrap().reset();
        self.events.send(ManagerEvent::Connect).ok();

        // re-join every namespace; their buffered emits flush on the ack
        for socket in self.all_sockets() {
            if let Err(e) = socket.send_connect() {
                warn!("[ns={}] error sending connect packet: {}", socket.ns, e);
            }
        }

        let manager = self.clone();
        tokio::spawn(async move { manager.run(conn).await });
        Ok(())
    }

    /// Drives one connection until it dies: pumps the shared write buffer
    /// out and dispatches everything that comes in.
    async fn run(self: Arc<Self>, mut conn: Conn) {
        let mut out = match self.out_rx.try_lock() {
            Ok(out) => out,
            Err(_) => {
                warn!("connection task already running");
                return;
            }
        };
        loop {
            tokio::select! {
                outgoing = out.recv() => match outgoing {
                    Some(packet) => {
                        let closing = matches!(packet, EnginePacket::Close);
                        if conn.send(packet).await.is_err() {
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = conn.recv() => match incoming {
                    Some(Ok(packet)) => self.handle_packet(packet),
                    Some(Err(e)) => {
                        debug!("transport error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }
        drop(out);
        drop(conn);
        self.on_close();
    }

    fn handle_packet(&self, packet: EnginePacket) {
        match packet {
            // server initiated heartbeat: answer within the ping timeout
            EnginePacket::Ping => {
                self.out_tx.send(EnginePacket::Pong).ok();
            }
            EnginePacket::Message(msg) => self.handle_message(msg.as_str()),
            EnginePacket::Binary(data) => self.handle_binary(data),
            EnginePacket::Close => {
                debug!("server closed the session");
            }
            packet => {
                debug!("ignoring engine packet: {:?}", packet);
            }
        }
    }

    fn handle_message(&self, msg: &str) {
        if self.state.lock().unwrap().partial_bin_packet.take().is_some() {
            warn!("text packet interleaved with pending binary attachments");
        }
        let packet = match Packet::try_from(msg) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping unparseable packet: {}", e);
                return;
            }
        };
        match packet.inner {
            PacketData::BinaryEvent(_, _, _) | PacketData::BinaryAck(_, _) => {
                self.state.lock().unwrap().partial_bin_packet = Some(packet);
            }
            inner => self.route(&packet.ns, inner),
        }
    }

    fn handle_binary(&self, data: Bytes) {
        let complete = {
            let mut state = self.state.lock().unwrap();
            match state.partial_bin_packet.as_mut() {
                Some(packet) => match &mut packet.inner {
                    PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _) => {
                        bin.add_payload(data);
                        bin.is_complete()
                    }
                    _ => false,
                },
                None => {
                    warn!("unexpected binary frame dropped");
                    return;
                }
            }
        };
        if complete {
            let packet = self.state.lock().unwrap().partial_bin_packet.take();
            if let Some(packet) = packet {
                self.route(&packet.ns, packet.inner);
            }
        }
    }

    fn route(&self, ns: &str, packet: PacketData<'static>) {
        let socket = self.sockets.lock().unwrap().get(ns).cloned();
        match socket {
            Some(socket) => socket.recv(packet),
            None => debug!("packet for unknown namespace {} dropped", ns),
        }
    }

    fn on_close(self: &Arc<Self>) {
        let closing = {
            let mut state = self.state.lock().unwrap();
            state.open = false;
            state.sid = None;
            state.partial_bin_packet = None;
            state.closing
        };
        debug!("connection closed (user initiated: {closing})");
        self.events.send(ManagerEvent::Disconnect).ok();
        for socket in self.all_sockets() {
            socket.on_transport_close();
        }

        if self.config.reconnection && !closing {
            let manager = self.clone();
            tokio::spawn(async move { manager.reconnect().await });
        }
    }

    /// The reconnection schedule: sleep per the backoff, retry, reset on
    /// success, give up once the attempt cap is reached.
    async fn reconnect(self: Arc<Self>) {
        loop {
            let delay = self.backoff.lock().unwrap().next_delay();
            let Some(delay) = delay else {
                warn!("reconnection attempts exhausted");
                self.events.send(ManagerEvent::ReconnectFailed).ok();
                break;
            };
            let attempt = self.backoff.lock().unwrap().attempts();
            tokio::time::sleep(delay).await;
            if self.state.lock().unwrap().closing {
                break;
            }
            self.events.send(ManagerEvent::ReconnectAttempt(attempt)).ok();
            match self.open_inner().await {
                Ok(()) => break,
                Err(e) => debug!("reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Closes the connection for good: no reconnection follows.
    pub fn close(&self) {
        self.state.lock().unwrap().closing = true;
        self.out_tx.send(EnginePacket::Close).ok();
    }

    /// Whether the engine handshake is currently established.
    pub fn connected(&self) -> bool {
        self.state.lock().unwrap().open
    }

    /// The current session id, when connected.
    pub fn sid(&self) -> Option<Sid> {
        self.state.lock().unwrap().sid
    }

    /// Observes the manager lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn all_sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.lock().unwrap().values().cloned().collect()
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("connected", &self.connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::future::BoxFuture;
    use serde_json::json;

    use relayio_engine::{OpenPacket, Str};

    use super::*;
    use crate::transport::PipeEnd;

    struct QueueConnector {
        conns: Mutex<VecDeque<Conn>>,
    }

    impl QueueConnector {
        fn new(conns: impl IntoIterator<Item = Conn>) -> Self {
            Self {
                conns: Mutex::new(conns.into_iter().collect()),
            }
        }
    }

    impl Connector for QueueConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Conn, ClientError>> {
            let conn = self.conns.lock().unwrap().pop_front();
            Box::pin(async move { conn.ok_or(ClientError::Disconnected) })
        }
    }

    fn open_packet(sid: Sid) -> EnginePacket {
        EnginePacket::Open(OpenPacket {
            sid,
            upgrades: vec![],
            ping_interval: 25000,
            ping_timeout: 20000,
            max_payload: 100_000,
        })
    }

    fn connect_ack(sid: Sid) -> EnginePacket {
        EnginePacket::Message(Str::from(format!("0{}", json!({ "sid": sid }))))
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            reconnection_delay: Duration::from_millis(10),
            reconnection_delay_max: Duration::from_millis(20),
            randomization_factor: 0.0,
            ..Default::default()
        }
    }

    async fn expect_message(server: &mut PipeEnd) -> String {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(1), server.rx.recv())
                .await
                .expect("timed out waiting for a client packet")
                .expect("client connection closed");
            if let EnginePacket::Message(msg) = packet {
                return msg.to_string();
            }
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn handshake_and_namespace_join() {
        let (conn, mut server) = Conn::pipe(32);
        let sid = Sid::new();
        server.tx.try_send(open_packet(sid)).unwrap();

        let manager = Manager::new(QueueConnector::new([conn]), test_config());
        let socket = manager.socket("/");
        manager.open().await.unwrap();
        assert_eq!(manager.sid(), Some(sid));

        assert_eq!(expect_message(&mut server).await, "0");
        server.tx.try_send(connect_ack(sid)).unwrap();
        wait_until(|| socket.connected()).await;
    }

    #[tokio::test]
    async fn open_twice_is_rejected() {
        let (conn, server) = Conn::pipe(32);
        let sid = Sid::new();
        server.tx.try_send(open_packet(sid)).unwrap();

        let manager = Manager::new(QueueConnector::new([conn]), test_config());
        manager.open().await.unwrap();
        assert!(matches!(
            manager.open().await,
            Err(ClientError::AlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn pings_are_answered() {
        let (conn, mut server) = Conn::pipe(32);
        let sid = Sid::new();
        server.tx.try_send(open_packet(sid)).unwrap();

        let manager = Manager::new(QueueConnector::new([conn]), test_config());
        manager.open().await.unwrap();

        server.tx.try_send(EnginePacket::Ping).unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(1), server.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong, EnginePacket::Pong);
    }

    #[tokio::test]
    async fn buffered_emits_replay_after_reconnect() {
        let (conn1, mut server1) = Conn::pipe(32);
        let (conn2, mut server2) = Conn::pipe(32);
        let sid1 = Sid::new();
        let sid2 = Sid::new();
        server1.tx.try_send(open_packet(sid1)).unwrap();
        server2.tx.try_send(open_packet(sid2)).unwrap();

        let manager = Manager::new(QueueConnector::new([conn1, conn2]), test_config());
        let socket = manager.socket("/");
        manager.open().await.unwrap();

        assert_eq!(expect_message(&mut server1).await, "0");
        server1.tx.try_send(connect_ack(sid1)).unwrap();
        wait_until(|| socket.connected()).await;

        // the transport dies
        drop(server1);
        wait_until(|| !socket.connected()).await;

        // emitted while disconnected: buffered, not lost
        socket.emit("q", 1).unwrap();
        assert_eq!(socket.buffered_len(), 1);

        // the manager reconnects on its own and re-joins the namespace
        assert_eq!(expect_message(&mut server2).await, "0");
        assert_eq!(manager.sid(), Some(sid2));
        server2.tx.try_send(connect_ack(sid2)).unwrap();

        // the buffered event arrives exactly once, after the connect ack
        let replay = expect_message(&mut server2).await;
        assert_eq!(replay, format!("2{}", json!(["q", 1])));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server2.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_the_attempt_cap() {
        let (conn, mut server) = Conn::pipe(32);
        let sid = Sid::new();
        server.tx.try_send(open_packet(sid)).unwrap();

        let config = ManagerConfig {
            reconnection_attempts: Some(2),
            ..test_config()
        };
        let manager = Manager::new(QueueConnector::new([conn]), config);
        let mut events = manager.subscribe();
        manager.open().await.unwrap();

        drop(server);

        let mut seen_attempts = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("timed out waiting for manager events")
                .unwrap();
            match event {
                ManagerEvent::ReconnectAttempt(_) => seen_attempts += 1,
                ManagerEvent::ReconnectFailed => break,
                _ => (),
            }
        }
        assert_eq!(seen_attempts, 2);
        assert!(!manager.connected());
    }

    #[tokio::test]
    async fn user_close_suppresses_reconnection() {
        let (conn, mut server) = Conn::pipe(32);
        let sid = Sid::new();
        server.tx.try_send(open_packet(sid)).unwrap();

        let manager = Manager::new(QueueConnector::new([conn]), test_config());
        let mut events = manager.subscribe();
        manager.open().await.unwrap();

        manager.close();
        // the CLOSE packet reaches the server and the connection ends
        let close = tokio::time::timeout(Duration::from_secs(1), server.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(close, EnginePacket::Close);

        wait_until(|| !manager.connected()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // no reconnect attempt is ever scheduled
        loop {
            match events.try_recv() {
                Ok(ManagerEvent::ReconnectAttempt(_)) => panic!("unexpected reconnect"),
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn pending_acks_survive_with_retries() {
        let (conn1, mut server1) = Conn::pipe(32);
        let sid1 = Sid::new();
        server1.tx.try_send(open_packet(sid1)).unwrap();

        let config = ManagerConfig {
            retries: 1,
            reconnection: false,
            ..test_config()
        };
        let manager = Manager::new(QueueConnector::new([conn1]), config);
        let socket = manager.socket("/");
        manager.open().await.unwrap();
        assert_eq!(expect_message(&mut server1).await, "0");
        server1.tx.try_send(connect_ack(sid1)).unwrap();
        wait_until(|| socket.connected()).await;

        let ack: relayio::ack::AckStream<serde_json::Value> =
            socket.emit_with_ack("q", 1).unwrap();
        assert_eq!(
            expect_message(&mut server1).await,
            format!("21{}", json!(["q", 1]))
        );

        // the reply arrives before the transport dies: delivered even when
        // retries are configured
        server1
            .tx
            .try_send(EnginePacket::Message(Str::from("31[\"ok\"]".to_string())))
            .unwrap();
        let res = ack.await.unwrap();
        assert_eq!(res.data, json!(["ok"]));
    }
}
