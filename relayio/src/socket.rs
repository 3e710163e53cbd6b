use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use relayio_engine::{sid::Sid, DisconnectReason as EngineDisconnectReason, Session};

use crate::{
    ack::{AckInnerStream, AckResponse, AckResult, AckStream},
    adapter::{Adapter, LocalAdapter, Room},
    client::SessionData,
    config::RelayConfig,
    errors::{AckError, Error, SendError},
    handshake::Handshake,
    ns::Namespace,
    operators::{Operators, RoomParam},
    packet::{BinaryPacket, Packet, PacketData},
};

/// Event names the protocol reserves for itself. They are never dispatched
/// to application handlers when they arrive from the wire.
pub const RESERVED_EVENTS: [&str; 5] = [
    "connect",
    "connect_error",
    "disconnect",
    "newListener",
    "removeListener",
];

/// Why a socket left its namespace.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The peer closed the connection cleanly.
    TransportClose,
    /// The underlying connection failed.
    TransportError,
    /// The peer stopped answering pings.
    HeartbeatTimeout,
    /// The peer sent something unparseable.
    PacketParsing,
    /// The peer sent several polling requests at once.
    MultiplePollingRequests,
    /// The client sent a DISCONNECT packet for this namespace.
    ClientNSDisconnect,
    /// The server disconnected the socket from the namespace.
    ServerNSDisconnect,
    /// The server is shutting down.
    ClosingServer,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::HeartbeatTimeout => "ping timeout",
            DisconnectReason::PacketParsing => "parse error",
            DisconnectReason::MultiplePollingRequests => "multiple polling requests",
            DisconnectReason::ClientNSDisconnect => "client namespace disconnect",
            DisconnectReason::ServerNSDisconnect => "server namespace disconnect",
            DisconnectReason::ClosingServer => "server shutting down",
        };
        f.write_str(str)
    }
}

impl From<EngineDisconnectReason> for DisconnectReason {
    fn from(reason: EngineDisconnectReason) -> Self {
        match reason {
            EngineDisconnectReason::TransportClose => DisconnectReason::TransportClose,
            EngineDisconnectReason::TransportError => DisconnectReason::TransportError,
            EngineDisconnectReason::HeartbeatTimeout => DisconnectReason::HeartbeatTimeout,
            EngineDisconnectReason::PacketParsing => DisconnectReason::PacketParsing,
            EngineDisconnectReason::MultiplePollingRequests => {
                DisconnectReason::MultiplePollingRequests
            }
            EngineDisconnectReason::ClosingServer => DisconnectReason::ClosingServer,
        }
    }
}

type BoxedMessageHandler<A> =
    Box<dyn Fn(Arc<Socket<A>>, Value, Vec<Bytes>, Option<AckSender<A>>) -> BoxFuture<'static, ()> + Send + Sync>;
type BoxedDisconnectHandler<A> =
    Box<dyn Fn(Arc<Socket<A>>, DisconnectReason) -> BoxFuture<'static, ()> + Send + Sync>;

/// The reply capability handed to an event handler when the client asked
/// for an acknowledgement. Consuming it guarantees at most one reply.
pub struct AckSender<A: Adapter = LocalAdapter> {
    socket: Arc<Socket<A>>,
    ack_id: i64,
    binary: Vec<Bytes>,
}

impl<A: Adapter> AckSender<A> {
    fn new(socket: Arc<Socket<A>>, ack_id: i64) -> Self {
        Self {
            socket,
            ack_id,
            binary: Vec::new(),
        }
    }

    /// Attaches binary payloads to the reply.
    pub fn bin(mut self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.binary = binary.into_iter().map(Into::into).collect();
        self
    }

    /// Sends the reply to the client.
    pub fn send<T: Serialize>(self, data: T) -> Result<(), SendError> {
        let ns = self.socket.ns();
        let data = serde_json::to_value(data)?;
        let packet = if self.binary.is_empty() {
            Packet::ack(ns, data, self.ack_id)
        } else {
            Packet::bin_ack(ns, data, self.binary, self.ack_id)
        };
        self.socket.send(packet)
    }
}

/// A client connected to one namespace.
///
/// The socket is the application facing endpoint: it registers event
/// handlers, emits, joins and leaves rooms and tracks the pending
/// acknowledgements of its emits.
pub struct Socket<A: Adapter = LocalAdapter> {
    /// The socket id: the engine session id on the default namespace, a
    /// fresh id everywhere else.
    pub id: Sid,

    pub(crate) ns: Arc<Namespace<A>>,
    pub(crate) config: Arc<RelayConfig>,
    connected: AtomicBool,
    message_handlers: RwLock<HashMap<Cow<'static, str>, BoxedMessageHandler<A>>>,
    disconnect_handler: Mutex<Option<BoxedDisconnectHandler<A>>>,
    /// Pending acknowledgements of this socket's emits, by ack id.
    acks: Mutex<HashMap<i64, oneshot::Sender<AckResult<Value>>>>,
    /// Strictly increasing over the socket lifetime.
    ack_counter: AtomicI64,
    handshake: Handshake,
    esession: Arc<Session<SessionData<A>>>,
}

impl<A: Adapter> Socket<A> {
    pub(crate) fn new(
        id: Sid,
        ns: Arc<Namespace<A>>,
        esession: Arc<Session<SessionData<A>>>,
        handshake: Handshake,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            id,
            ns,
            config,
            connected: AtomicBool::new(false),
            message_handlers: RwLock::new(HashMap::new()),
            disconnect_handler: Mutex::new(None),
            acks: Mutex::new(HashMap::new()),
            ack_counter: AtomicI64::new(0),
            handshake,
            esession,
        }
    }

    /// Registers a handler for the given event name.
    ///
    /// The handler receives the socket, the event arguments, the binary
    /// attachments and, when the client asked for one, an [`AckSender`].
    pub fn on<C, F>(&self, event: impl Into<Cow<'static, str>>, callback: C)
    where
        C: Fn(Arc<Socket<A>>, Value, Vec<Bytes>, Option<AckSender<A>>) -> F
            + Send
            + Sync
            + 'static,
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: BoxedMessageHandler<A> = Box::new(move |socket, data, bin, ack| {
            Box::pin(callback(socket, data, bin, ack)) as BoxFuture<'static, ()>
        });
        self.message_handlers
            .write()
            .unwrap()
            .insert(event.into(), handler);
    }

    /// Registers the disconnect handler. Only one may be set; the last
    /// registration wins.
    pub fn on_disconnect<C, F>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>, DisconnectReason) -> F + Send + Sync + 'static,
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: BoxedDisconnectHandler<A> = Box::new(move |socket, reason| {
            Box::pin(callback(socket, reason)) as BoxFuture<'static, ()>
        });
        self.disconnect_handler.lock().unwrap().replace(handler);
    }

    /// Emits an event to this socket's client.
    pub fn emit<T: Serialize>(
        &self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<(), SendError> {
        if !self.connected() {
            return Err(SendError::Closed);
        }
        let data = serde_json::to_value(data)?;
        self.send(Packet::event(self.ns.path.clone(), event.into(), data))
    }

    /// Emits an event and returns the awaitable handle of its
    /// acknowledgement. The handle carries the configured ack timeout
    /// unless [`Operators::timeout`] overrode it.
    pub fn emit_with_ack<T: Serialize, V>(
        &self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<AckStream<V>, SendError> {
        if !self.connected() {
            return Err(SendError::Closed);
        }
        let data = serde_json::to_value(data)?;
        let packet = Packet::event(self.ns.path.clone(), event.into(), data);
        let rx = self.send_with_ack(packet)?;
        Ok(AckInnerStream::send(rx, self.config.ack_timeout).into())
    }

    // Room actions, delegated to the namespace adapter.

    /// Joins the given rooms, creating them as needed.
    pub fn join(&self, rooms: impl RoomParam) {
        self.ns.adapter.add_all(self.id, rooms)
    }

    /// Leaves the given rooms.
    pub fn leave(&self, rooms: impl RoomParam) {
        self.ns.adapter.del(self.id, rooms)
    }

    /// Leaves every room, including the one named by this socket's id.
    pub fn leave_all(&self) {
        self.ns.adapter.del_all(self.id)
    }

    /// The rooms this socket is in.
    pub fn rooms(&self) -> Vec<Room> {
        self.ns.adapter.socket_rooms(self.id)
    }

    // Broadcast operators.

    /// Selects everyone in the given rooms except this socket.
    pub fn to(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).to(rooms)
    }

    /// Selects everyone in the given rooms, this socket included.
    pub fn within(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).within(rooms)
    }

    /// Removes the members of the given rooms from the selection.
    pub fn except(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).except(rooms)
    }

    /// Selects the whole namespace except this socket.
    pub fn broadcast(&self) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).broadcast()
    }

    /// Stays on this node when a multi-node adapter is in use.
    pub fn local(&self) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).local()
    }

    /// Drops instead of failing when a target's write buffer is full.
    pub fn volatile(&self) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).volatile()
    }

    /// Custom ack deadline for the next emit.
    pub fn timeout(&self, timeout: Duration) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).timeout(timeout)
    }

    /// Attaches binary payloads to the next emit.
    pub fn bin(&self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Operators<A> {
        Operators::from_sock(self.ns.clone(), self.id).bin(binary)
    }

    /// Disconnects the socket from its namespace, notifying the client.
    pub fn disconnect(self: Arc<Self>) -> Result<(), SendError> {
        let res = self.send(Packet::disconnect(&self.ns.path));
        self.close(DisconnectReason::ServerNSDisconnect);
        res
    }

    /// The namespace path of this socket.
    pub fn ns(&self) -> &str {
        &self.ns.path
    }

    /// The connect-time data of this socket.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Whether the socket is still connected to its namespace.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Writes a packet to the engine session, binary attachments trailing.
    pub(crate) fn send(&self, packet: Packet<'_>) -> Result<(), SendError> {
        let (msg, bin) = packet.into_frames()?;
        self.send_raw(msg, &bin)
    }

    /// Writes pre-encoded frames. This is the shared egress of broadcasts:
    /// the adapter encodes once and every target socket goes through here.
    pub(crate) fn send_raw(
        &self,
        msg: relayio_engine::Str,
        bin: &[Bytes],
    ) -> Result<(), SendError> {
        self.esession.emit(msg)?;
        for payload in bin {
            self.esession.emit_binary(payload.clone())?;
        }
        Ok(())
    }

    /// Sends a packet stamped with a fresh ack id and returns the receiver
    /// its reply will complete.
    pub(crate) fn send_with_ack(
        &self,
        mut packet: Packet<'_>,
    ) -> Result<oneshot::Receiver<AckResult<Value>>, SendError> {
        let (tx, rx) = oneshot::channel();
        let ack_id = self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1;
        packet.inner.set_ack_id(ack_id);
        self.send(packet)?;
        self.acks.lock().unwrap().insert(ack_id, tx);
        Ok(rx)
    }

    /// Closes the underlying engine session. Used on server shutdown.
    pub(crate) fn close_underlying_session(&self) {
        self.esession
            .close(EngineDisconnectReason::ClosingServer);
    }

    /// Takes the socket out of its namespace.
    ///
    /// Idempotent. Fires the disconnect handler, fails every pending ack
    /// with a disconnect error exactly once, and clears the adapter and
    /// registry state.
    pub(crate) fn close(self: Arc<Self>, reason: DisconnectReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("[sid={}] socket disconnected: {}", self.id, reason);

        let pending: Vec<_> = {
            let mut acks = self.acks.lock().unwrap();
            acks.drain().collect()
        };
        for (_, tx) in pending {
            tx.send(Err(AckError::Disconnected)).ok();
        }

        if let Some(handler) = self.disconnect_handler.lock().unwrap().take() {
            tokio::spawn(handler(self.clone(), reason));
        }

        self.ns.remove_socket(self.id);
        self.esession
            .data
            .sockets
            .lock()
            .unwrap()
            .remove(self.ns.path.as_ref());
    }

    /// Routes a decoded packet of this namespace to its handler.
    pub(crate) fn recv(self: Arc<Self>, packet: PacketData<'static>) -> Result<(), Error> {
        match packet {
            PacketData::Event(e, data, ack) => self.recv_event(&e, data, Vec::new(), ack),
            PacketData::BinaryEvent(e, packet, ack) => {
                let BinaryPacket { data, bin, .. } = packet;
                self.recv_event(&e, data, bin, ack)
            }
            PacketData::EventAck(data, ack_id) => self.recv_ack(data, Vec::new(), ack_id),
            PacketData::BinaryAck(packet, ack_id) => {
                let BinaryPacket { data, bin, .. } = packet;
                self.recv_ack(data, bin, ack_id)
            }
            PacketData::Disconnect => {
                self.close(DisconnectReason::ClientNSDisconnect);
                Ok(())
            }
            _ => Err(Error::InvalidPacketType),
        }
    }

    fn recv_event(
        self: Arc<Self>,
        e: &str,
        data: Value,
        bin: Vec<Bytes>,
        ack: Option<i64>,
    ) -> Result<(), Error> {
        if RESERVED_EVENTS.contains(&e) {
            warn!("[sid={}] reserved event {e:?} dropped", self.id);
            return Ok(());
        }
        if let Some(handler) = self.message_handlers.read().unwrap().get(e) {
            let ack = ack.map(|ack_id| AckSender::new(self.clone(), ack_id));
            tokio::spawn(handler(self.clone(), data, bin, ack));
        }
        Ok(())
    }

    /// Completes the pending ack of one of this socket's emits. A reply to
    /// an unknown (already expired) id is discarded.
    fn recv_ack(self: Arc<Self>, data: Value, binary: Vec<Bytes>, ack_id: i64) -> Result<(), Error> {
        if let Some(tx) = self.acks.lock().unwrap().remove(&ack_id) {
            tx.send(Ok(AckResponse { data, binary })).ok();
        }
        Ok(())
    }
}

impl<A: Adapter> std::fmt::Debug for Socket<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("ns", &self.ns())
            .field("connected", &self.connected())
            .finish()
    }
}

impl<A: Adapter> PartialEq for Socket<A> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
impl<A: Adapter> Socket<A> {
    pub(crate) fn new_dummy(id: Sid, ns: Arc<Namespace<A>>) -> Self {
        let esession = Session::new_dummy(id, Box::new(|_, _| {}));
        let handshake = Handshake::new(None, &esession.req).unwrap();
        Socket::new(
            id,
            ns,
            esession,
            handshake,
            Arc::new(RelayConfig::default()),
        )
    }

    pub(crate) fn new_dummy_piped(
        id: Sid,
        ns: Arc<Namespace<A>>,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<relayio_engine::Packet>) {
        let (esession, rx) = Session::new_dummy_piped(id, Box::new(|_, _| {}), 256);
        let handshake = Handshake::new(None, &esession.req).unwrap();
        let socket = Arc::new(Socket::new(
            id,
            ns,
            esession,
            handshake,
            Arc::new(RelayConfig::default()),
        ));
        socket.set_connected();
        (socket, rx)
    }
}
