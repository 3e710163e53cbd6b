use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use bytes::Bytes;
use http::{request::Parts, Uri};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    config::EngineConfig, errors::Error, packet::Packet, peekable::PeekableReceiver,
    service::TransportType, sid::Sid, str::Str,
};

/// Why a session was closed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The peer sent a CLOSE packet or ended the transport cleanly.
    TransportClose,
    /// The transport failed mid-flight (connection reset, network change).
    TransportError,
    /// No PONG arrived within the ping timeout.
    HeartbeatTimeout,
    /// Two polling requests were in flight for the same session, which the
    /// protocol forbids.
    MultiplePollingRequests,
    /// An inbound frame could not be decoded.
    PacketParsing,
    /// The server is shutting down.
    ClosingServer,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::HeartbeatTimeout => "ping timeout",
            DisconnectReason::MultiplePollingRequests => "multiple polling requests",
            DisconnectReason::PacketParsing => "parse error",
            DisconnectReason::ClosingServer => "server shutting down",
        };
        f.write_str(str)
    }
}

/// The parts of the handshake http request kept on the session.
#[derive(Debug, Default)]
pub struct SessionReq {
    pub uri: Uri,
    pub headers: http::HeaderMap,
}

impl From<&Parts> for SessionReq {
    fn from(parts: &Parts) -> Self {
        Self {
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        }
    }
}
impl From<Parts> for SessionReq {
    fn from(parts: Parts) -> Self {
        Self {
            uri: parts.uri,
            headers: parts.headers,
        }
    }
}

pub(crate) type CloseFn = Box<dyn Fn(Sid, DisconnectReason) + Send + Sync>;

/// One connected peer, independent of the transport currently carrying it.
///
/// The session owns the bounded write buffer every outgoing packet goes
/// through, the heartbeat task, and the user data `D` bound by the handler.
/// All transport swaps and buffer operations are serialized through the
/// session's own locks; sessions never contend with each other.
pub struct Session<D> {
    /// The session id, assigned at handshake.
    pub sid: Sid,

    /// Current transport, stored as a bitfield so it can be swapped during
    /// the upgrade without a lock.
    transport: AtomicU8,

    /// Consumer side of the write buffer.
    ///
    /// Locked by whichever transport is currently draining it: for each
    /// polling request the lock is taken and released, for websocket it is
    /// held for the whole connection. A contended lock on the polling path
    /// therefore means a concurrent poll, which is a protocol violation.
    pub(crate) internal_rx: Mutex<PeekableReceiver<Packet>>,
    internal_tx: mpsc::Sender<Packet>,

    /// Heartbeat plumbing: the transport pushes a unit for every PONG it
    /// reads and the heartbeat task waits on the other end.
    pong_rx: Mutex<mpsc::Receiver<()>>,
    pub(crate) pong_tx: mpsc::Sender<()>,
    heartbeat_handle: StdMutex<Option<JoinHandle<()>>>,

    close_fn: CloseFn,

    /// User data bound to the session by the handler.
    pub data: D,

    /// Handshake request data.
    pub req: Arc<SessionReq>,
}

impl<D: Default> Session<D> {
    pub(crate) fn new(
        sid: Sid,
        transport: TransportType,
        config: &EngineConfig,
        req: SessionReq,
        close_fn: CloseFn,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(config.max_buffer_size);
        let (pong_tx, pong_rx) = mpsc::channel(1);

        Self {
            sid,
            transport: AtomicU8::new(transport as u8),
            internal_rx: Mutex::new(PeekableReceiver::new(internal_rx)),
            internal_tx,
            pong_rx: Mutex::new(pong_rx),
            pong_tx,
            heartbeat_handle: StdMutex::new(None),
            close_fn,
            data: D::default(),
            req: Arc::new(req),
        }
    }
}

impl<D> Session<D> {
    /// Appends a packet to the session write buffer.
    pub(crate) fn send(&self, packet: Packet) -> Result<(), Error> {
        debug!("[sid={}] sending packet: {:?}", self.sid, packet);
        self.internal_tx.try_send(packet)?;
        Ok(())
    }

    /// Emits a message to the peer.
    ///
    /// On websocket it leaves as a text frame immediately; on polling it is
    /// buffered until the next poll. Fails when the write buffer is full or
    /// the session is closed.
    pub fn emit(&self, msg: impl Into<Str>) -> Result<(), Error> {
        self.send(Packet::Message(msg.into()))
    }

    /// Emits a binary payload to the peer.
    ///
    /// On websocket it leaves as a binary frame; on polling it is base64
    /// encoded into the next poll body.
    pub fn emit_binary(&self, data: Bytes) -> Result<(), Error> {
        self.send(Packet::Binary(data))
    }

    /// Closes the session. Idempotent: the engine drops the registration on
    /// the first call and ignores the rest.
    pub fn close(&self, reason: DisconnectReason) {
        (self.close_fn)(self.sid, reason);
        self.send(Packet::Close).ok();
    }

    pub(crate) fn abort_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub(crate) fn is_ws(&self) -> bool {
        self.transport.load(Ordering::Relaxed) == TransportType::Websocket as u8
    }
    pub(crate) fn is_polling(&self) -> bool {
        self.transport.load(Ordering::Relaxed) == TransportType::Polling as u8
    }

    /// The transport currently carrying this session.
    pub fn transport_type(&self) -> TransportType {
        if self.is_ws() {
            TransportType::Websocket
        } else {
            TransportType::Polling
        }
    }

    /// Swaps the session onto the websocket transport once the upgrade
    /// handshake has completed.
    pub(crate) fn upgrade_to_websocket(&self) {
        self.transport
            .store(TransportType::Websocket as u8, Ordering::Relaxed);
    }
}

impl<D: Send + Sync + 'static> Session<D> {
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = session.heartbeat_job(interval, timeout).await {
                debug!("[sid={}] heartbeat error: {:?}", session.sid, e);
                session.close(DisconnectReason::HeartbeatTimeout);
            }
        });
        if let Some(old) = self.heartbeat_handle.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Sends a PING every `interval` and expects a PONG within `timeout`.
    async fn heartbeat_job(&self, interval: Duration, timeout: Duration) -> Result<(), Error> {
        let mut pong_rx = self
            .pong_rx
            .try_lock()
            .expect("a session spawns its heartbeat job only once");

        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        debug!("[sid={}] heartbeat started", self.sid);
        loop {
            tick.tick().await;
            // a pong that raced the previous round must not satisfy this one
            pong_rx.try_recv().ok();
            self.internal_tx
                .try_send(Packet::Ping)
                .map_err(|_| Error::HeartbeatTimeout)?;
            tokio::time::timeout(timeout, pong_rx.recv())
                .await
                .map_err(|_| Error::HeartbeatTimeout)?
                .ok_or(Error::HeartbeatTimeout)?;
        }
    }
}

impl<D> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("transport", &self.transport_type())
            .finish()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl<D: Default> Session<D> {
    /// Test constructor: a websocket-flavoured session whose write buffer is
    /// handed back to the caller so emitted packets can be observed.
    #[doc(hidden)]
    pub fn new_dummy_piped(
        sid: Sid,
        close_fn: CloseFn,
        buffer_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (internal_tx, internal_rx) = mpsc::channel(buffer_size);
        let (_, unused_rx) = mpsc::channel(1);
        let (pong_tx, pong_rx) = mpsc::channel(1);
        let session = Arc::new(Self {
            sid,
            transport: AtomicU8::new(TransportType::Websocket as u8),
            internal_rx: Mutex::new(PeekableReceiver::new(unused_rx)),
            internal_tx,
            pong_rx: Mutex::new(pong_rx),
            pong_tx,
            heartbeat_handle: StdMutex::new(None),
            close_fn,
            data: D::default(),
            req: Arc::new(SessionReq::default()),
        });
        (session, internal_rx)
    }

    /// Test constructor: like [`Session::new_dummy_piped`] but discards the
    /// emitted packets.
    #[doc(hidden)]
    pub fn new_dummy(sid: Sid, close_fn: CloseFn) -> Arc<Self> {
        let (session, mut rx) = Self::new_dummy_piped(sid, close_fn, 256);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        session
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl<D: Send + Sync + 'static> Session<D> {
    /// Test hook used to drive the heartbeat without a transport.
    #[doc(hidden)]
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        self.spawn_heartbeat(interval, timeout);
    }

    /// Test hook simulating a PONG frame from the peer.
    #[doc(hidden)]
    pub fn notify_pong(&self) {
        self.pong_tx.try_send(()).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn heartbeat_timeout_closes_the_session() {
        let (tx, mut closed) = mpsc::channel(1);
        let close_fn: CloseFn = Box::new(move |_, reason| {
            tx.try_send(reason).ok();
        });
        let (session, mut rx) = Session::<()>::new_dummy_piped(Sid::new(), close_fn, 16);
        session.start_heartbeat(Duration::from_millis(50), Duration::from_millis(50));

        // the ping goes out and is never answered
        let ping = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping, Packet::Ping);

        let reason = tokio::time::timeout(Duration::from_millis(200), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::HeartbeatTimeout);
    }

    #[tokio::test]
    async fn heartbeat_survives_when_pongs_arrive() {
        let (tx, mut closed) = mpsc::channel(1);
        let close_fn: CloseFn = Box::new(move |_, reason| {
            tx.try_send(reason).ok();
        });
        let (session, mut rx) = Session::<()>::new_dummy_piped(Sid::new(), close_fn, 16);
        session.start_heartbeat(Duration::from_millis(30), Duration::from_millis(30));

        for _ in 0..3 {
            let ping = tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ping, Packet::Ping);
            session.notify_pong();
        }
        assert!(closed.try_recv().is_err());
        session.abort_heartbeat();
    }

    #[tokio::test]
    async fn full_buffer_rejects_emits() {
        let (session, _rx) = Session::<()>::new_dummy_piped(Sid::new(), Box::new(|_, _| {}), 2);
        session.emit("a").unwrap();
        session.emit("b").unwrap();
        assert!(matches!(session.emit("c"), Err(Error::BufferFull)));
    }
}
