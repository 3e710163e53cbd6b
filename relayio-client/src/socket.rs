use std::{
    borrow::Cow,
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Mutex, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use relayio::{
    ack::{AckInnerStream, AckResponse, AckResult, AckStream},
    errors::AckError,
    packet::{BinaryPacket, Packet, PacketData},
};
use relayio_engine::Packet as EnginePacket;

use crate::errors::ClientError;

type EventHandler = Box<dyn Fn(Value, Vec<Bytes>) + Send + Sync>;

/// A client-side socket bound to one namespace of a [`Manager`].
///
/// Emits issued while the connection is down are queued in a FIFO buffer
/// and flushed once the namespace is re-joined after a reconnect.
///
/// [`Manager`]: crate::manager::Manager
pub struct Socket {
    pub ns: Cow<'static, str>,
    connected: AtomicBool,
    /// Events emitted while disconnected, drained in emit order after the
    /// CONNECT ack.
    send_buffer: Mutex<VecDeque<Packet<'static>>>,
    handlers: RwLock<HashMap<Cow<'static, str>, EventHandler>>,
    acks: Mutex<HashMap<i64, oneshot::Sender<AckResult<Value>>>>,
    ack_counter: AtomicI64,
    /// With `retries > 0`, pending acks survive a disconnect and their
    /// reply is still accepted after the reconnect. With 0 they fail at
    /// disconnect time.
    retries: u32,
    ack_timeout: Duration,
    auth: Mutex<Option<Value>>,
    out: mpsc::UnboundedSender<EnginePacket>,
}

impl Socket {
    pub(crate) fn new(
        ns: Cow<'static, str>,
        out: mpsc::UnboundedSender<EnginePacket>,
        ack_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            ns,
            connected: AtomicBool::new(false),
            send_buffer: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            ack_counter: AtomicI64::new(0),
            retries,
            ack_timeout,
            auth: Mutex::new(None),
            out,
        }
    }

    /// Sets the auth payload sent with every CONNECT for this namespace.
    pub fn set_auth(&self, auth: impl Serialize) -> Result<(), ClientError> {
        let auth = serde_json::to_value(auth)?;
        self.auth.lock().unwrap().replace(auth);
        Ok(())
    }

    /// Registers a handler for the given event name.
    pub fn on(
        &self,
        event: impl Into<Cow<'static, str>>,
        callback: impl Fn(Value, Vec<Bytes>) + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .unwrap()
            .insert(event.into(), Box::new(callback));
    }

    /// Whether the namespace is currently joined.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Emits an event. While disconnected the event is buffered and leaves
    /// after the next successful CONNECT, in emit order.
    pub fn emit<T: Serialize>(
        &self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<(), ClientError> {
        let data = serde_json::to_value(data)?;
        let packet = Packet::event(self.ns.clone(), event.into(), data);
        self.send_or_buffer(packet)
    }

    /// Emits an event and returns the awaitable handle of its
    /// acknowledgement. The deadline starts now, even if the event itself
    /// is buffered until a reconnect.
    pub fn emit_with_ack<T: Serialize, V>(
        &self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<AckStream<V>, ClientError> {
        let data = serde_json::to_value(data)?;
        let mut packet = Packet::event(self.ns.clone(), event.into(), data);

        let (tx, rx) = oneshot::channel();
        let ack_id = self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1;
        packet.inner.set_ack_id(ack_id);
        self.acks.lock().unwrap().insert(ack_id, tx);
        self.send_or_buffer(packet)?;
        Ok(AckInnerStream::send(rx, self.ack_timeout).into())
    }

    fn send_or_buffer(&self, packet: Packet<'static>) -> Result<(), ClientError> {
        if self.connected() {
            self.write(packet)
        } else {
            debug!("[ns={}] buffering packet while disconnected", self.ns);
            self.send_buffer.lock().unwrap().push_back(packet);
            Ok(())
        }
    }

    /// Encodes a packet into engine frames and hands them to the manager.
    fn write(&self, packet: Packet<'static>) -> Result<(), ClientError> {
        let (msg, bin) = packet.into_frames()?;
        self.out
            .send(EnginePacket::Message(msg))
            .map_err(|_| ClientError::Disconnected)?;
        for payload in bin {
            self.out
                .send(EnginePacket::Binary(payload))
                .map_err(|_| ClientError::Disconnected)?;
        }
        Ok(())
    }

    /// Sends the CONNECT packet for this namespace. Called by the manager
    /// on every (re)open.
    pub(crate) fn send_connect(&self) -> Result<(), ClientError> {
        let auth = self
            .auth
            .lock()
            .unwrap()
            .as_ref()
            .map(|auth| auth.to_string());
        let packet = Packet {
            ns: self.ns.clone(),
            inner: PacketData::Connect(auth),
        };
        self.write(packet)
    }

    /// The server accepted the CONNECT: flush everything buffered while the
    /// connection was down.
    pub(crate) fn on_connect_ack(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let buffered: Vec<_> = {
            let mut buffer = self.send_buffer.lock().unwrap();
            buffer.drain(..).collect()
        };
        if !buffered.is_empty() {
            debug!("[ns={}] flushing {} buffered packets", self.ns, buffered.len());
        }
        for packet in buffered {
            if let Err(e) = self.write(packet) {
                warn!("[ns={}] error flushing buffered packet: {}", self.ns, e);
                break;
            }
        }
    }

    /// The connection dropped. Pending acks fail now unless retries keep
    /// them alive across the reconnect.
    pub(crate) fn on_transport_close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.retries == 0 {
            let pending: Vec<_> = {
                let mut acks = self.acks.lock().unwrap();
                acks.drain().collect()
            };
            for (_, tx) in pending {
                tx.send(Err(AckError::Disconnected)).ok();
            }
        }
    }

    /// Routes a decoded packet of this namespace.
    pub(crate) fn recv(&self, packet: PacketData<'static>) {
        match packet {
            PacketData::Event(e, data, _ack) => self.dispatch(&e, data, Vec::new()),
            PacketData::BinaryEvent(e, packet, _ack) => {
                let BinaryPacket { data, bin, .. } = packet;
                self.dispatch(&e, data, bin)
            }
            PacketData::EventAck(data, ack_id) => self.recv_ack(data, Vec::new(), ack_id),
            PacketData::BinaryAck(packet, ack_id) => {
                let BinaryPacket { data, bin, .. } = packet;
                self.recv_ack(data, bin, ack_id)
            }
            PacketData::Disconnect => {
                debug!("[ns={}] server disconnected the namespace", self.ns);
                self.connected.store(false, Ordering::SeqCst);
                self.on_transport_close();
            }
            PacketData::ConnectError(err) => {
                warn!("[ns={}] connect refused: {}", self.ns, err);
                self.dispatch("connect_error", serde_json::json!([err]), Vec::new());
            }
            PacketData::Connect(_) => self.on_connect_ack(),
        }
    }

    fn dispatch(&self, event: &str, data: Value, bin: Vec<Bytes>) {
        if let Some(handler) = self.handlers.read().unwrap().get(event) {
            handler(data, bin);
        }
    }

    fn recv_ack(&self, data: Value, binary: Vec<Bytes>, ack_id: i64) {
        if let Some(tx) = self.acks.lock().unwrap().remove(&ack_id) {
            tx.send(Ok(AckResponse { data, binary })).ok();
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.send_buffer.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("ns", &self.ns)
            .field("connected", &self.connected())
            .finish()
    }
}
