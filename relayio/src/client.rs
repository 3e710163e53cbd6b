use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use relayio_engine::{
    handler::SessionHandler, str::Str, DisconnectReason as EngineDisconnectReason, Session,
};

use crate::{
    adapter::Adapter,
    config::RelayConfig,
    handshake::Handshake,
    ns::{Authorizer, Namespace, NsCallback},
    packet::{Packet, PacketData},
    socket::Socket,
    errors::Error,
};

/// How a dynamic namespace registration matches a requested path.
#[derive(Clone)]
pub enum NsMatcher {
    /// Matches every path starting with the prefix (e.g. `"/rooms/"`).
    Prefix(Cow<'static, str>),
    /// Matches through a custom predicate.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl NsMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            NsMatcher::Prefix(prefix) => path.starts_with(prefix.as_ref()),
            NsMatcher::Custom(predicate) => predicate(path),
        }
    }
}

impl std::fmt::Debug for NsMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NsMatcher::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            NsMatcher::Custom(_) => f.debug_tuple("Custom").finish(),
        }
    }
}

struct DynNsEntry<A: Adapter> {
    matcher: NsMatcher,
    callback: NsCallback<A>,
    authorizer: Option<Authorizer>,
}

/// Per engine-session state of the messaging layer.
pub struct SessionData<A: Adapter> {
    /// A binary packet whose attachments have not all arrived yet.
    partial_bin_packet: Mutex<Option<Packet<'static>>>,
    /// Fired when the session joins its first namespace, disarming the
    /// connect timeout.
    connect_recv_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// The sockets of this session, one per joined namespace.
    pub(crate) sockets: Mutex<HashMap<Cow<'static, str>, Arc<Socket<A>>>>,
}

impl<A: Adapter> Default for SessionData<A> {
    fn default() -> Self {
        Self {
            partial_bin_packet: Mutex::new(None),
            connect_recv_tx: Mutex::new(None),
            sockets: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: Adapter> std::fmt::Debug for SessionData<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData").finish()
    }
}

/// The demultiplexer between the engine and the namespaces.
///
/// One instance serves the whole server: it owns the namespace registry,
/// decodes every inbound engine message and routes it to the socket of the
/// right (session, namespace) pair.
pub struct Client<A: Adapter> {
    pub(crate) config: Arc<RelayConfig>,
    ns: RwLock<HashMap<Cow<'static, str>, Arc<Namespace<A>>>>,
    dyn_ns: RwLock<Vec<DynNsEntry<A>>>,
}

impl<A: Adapter> Client<A> {
    pub(crate) fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            config,
            ns: RwLock::new(HashMap::new()),
            dyn_ns: RwLock::new(Vec::new()),
        }
    }

    /// Registers a namespace.
    pub(crate) fn add_ns(
        &self,
        path: Cow<'static, str>,
        callback: NsCallback<A>,
        authorizer: Option<Authorizer>,
    ) -> Arc<Namespace<A>> {
        debug!("adding namespace {}", path);
        let ns = Namespace::new(path.clone(), callback, authorizer, self.config.clone());
        self.ns.write().unwrap().insert(path, ns.clone());
        ns
    }

    /// Registers a dynamic namespace matcher. On a CONNECT to an unknown
    /// path the matchers run in registration order; the first match
    /// instantiates the namespace, which is then cached like a static one.
    pub(crate) fn add_dyn_ns(
        &self,
        matcher: NsMatcher,
        callback: NsCallback<A>,
        authorizer: Option<Authorizer>,
    ) {
        debug!("adding dynamic namespace {:?}", matcher);
        self.dyn_ns.write().unwrap().push(DynNsEntry {
            matcher,
            callback,
            authorizer,
        });
    }

    /// Removes a namespace and disconnects everyone on it.
    pub(crate) fn delete_ns(&self, path: &str) {
        debug!("deleting namespace {}", path);
        if let Some(ns) = self.ns.write().unwrap().remove(path) {
            ns.close(crate::socket::DisconnectReason::ServerNSDisconnect);
        }
    }

    pub(crate) fn get_ns(&self, path: &str) -> Option<Arc<Namespace<A>>> {
        self.ns.read().unwrap().get(path).cloned()
    }

    fn get_or_create_ns(&self, path: &str) -> Option<Arc<Namespace<A>>> {
        if let Some(ns) = self.get_ns(path) {
            return Some(ns);
        }
        let (callback, authorizer) = {
            let matchers = self.dyn_ns.read().unwrap();
            let entry = matchers.iter().find(|entry| entry.matcher.matches(path))?;
            (entry.callback.clone(), entry.authorizer.clone())
        };
        debug!("instantiating dynamic namespace {}", path);
        let ns = Namespace::new(
            Cow::Owned(path.to_string()),
            callback,
            authorizer,
            self.config.clone(),
        );
        // another connect may have raced the instantiation: first in wins
        let ns = self
            .ns
            .write()
            .unwrap()
            .entry(Cow::Owned(path.to_string()))
            .or_insert(ns)
            .clone();
        Some(ns)
    }

    /// Handles a CONNECT packet: resolves the namespace, runs the connect
    /// handshake and answers with CONNECT or CONNECT_ERROR.
    fn sock_connect(
        &self,
        auth: Option<String>,
        ns_path: &str,
        session: &Arc<Session<SessionData<A>>>,
    ) -> Result<(), Error> {
        let Some(ns) = self.get_or_create_ns(ns_path) else {
            debug!("invalid namespace requested: {}", ns_path);
            let packet: String =
                Packet::connect_error(ns_path, "Invalid namespace", None).try_into()?;
            session.emit(packet).ok();
            return Ok(());
        };

        let handshake = Handshake::new(auth, &session.req)?;
        match ns.connect(session.clone(), handshake) {
            Ok(()) => {
                if let Some(tx) = session.data.connect_recv_tx.lock().unwrap().take() {
                    tx.send(()).ok();
                }
            }
            Err(err) => {
                debug!("connection to {} refused: {}", ns_path, err.message);
                let packet: String =
                    Packet::connect_error(ns_path, &err.message, err.data).try_into()?;
                session.emit(packet).ok();
            }
        }
        Ok(())
    }

    /// Routes a decoded non-connect packet to the session's socket for the
    /// target namespace. Packets for namespaces the session never joined
    /// are discarded.
    fn route(
        &self,
        ns_path: &str,
        packet: PacketData<'static>,
        session: &Arc<Session<SessionData<A>>>,
    ) -> Result<(), Error> {
        let socket = session.data.sockets.lock().unwrap().get(ns_path).cloned();
        match socket {
            Some(socket) => socket.recv(packet),
            None => {
                debug!(
                    "[sid={}] packet for unjoined namespace {} dropped",
                    session.sid, ns_path
                );
                Ok(())
            }
        }
    }

    /// Closes every namespace, disconnecting all sockets and their
    /// sessions. Used for graceful shutdown.
    pub(crate) fn close(&self) {
        debug!("closing all namespaces");
        let all: Vec<_> = self.ns.read().unwrap().values().cloned().collect();
        for ns in all {
            ns.close(crate::socket::DisconnectReason::ClosingServer);
        }
    }
}

impl<A: Adapter> SessionHandler for Client<A> {
    type Data = SessionData<A>;

    /// Arms the connect timeout: a session that joins no namespace in time
    /// is closed.
    fn on_connect(&self, session: Arc<Session<SessionData<A>>>) {
        debug!("[sid={}] engine session connected", session.sid);
        let (tx, rx) = oneshot::channel();
        session.data.connect_recv_tx.lock().unwrap().replace(tx);
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, rx).await.is_err() {
                debug!("[sid={}] connect timeout", session.sid);
                session.close(EngineDisconnectReason::TransportClose);
            }
        });
    }

    fn on_disconnect(&self, session: Arc<Session<SessionData<A>>>, reason: EngineDisconnectReason) {
        debug!(
            "[sid={}] engine session disconnected: {}",
            session.sid, reason
        );
        let sockets: Vec<_> = {
            let mut sockets = session.data.sockets.lock().unwrap();
            sockets.drain().map(|(_, socket)| socket).collect()
        };
        for socket in sockets {
            socket.close(reason.into());
        }
    }

    fn on_message(&self, msg: Str, session: Arc<Session<SessionData<A>>>) {
        debug!("[sid={}] received message: {:?}", session.sid, msg);
        // a text packet while binary attachments are pending resets the
        // decoder and fails the session
        if session.data.partial_bin_packet.lock().unwrap().take().is_some() {
            debug!("[sid={}] text packet interleaved with attachments", session.sid);
            session.close(EngineDisconnectReason::PacketParsing);
            return;
        }

        let packet = match Packet::try_from(msg.as_str()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("[sid={}] packet parse error: {}", session.sid, e);
                session.close(EngineDisconnectReason::PacketParsing);
                return;
            }
        };

        let res = match packet.inner {
            PacketData::Connect(auth) => self.sock_connect(auth, &packet.ns, &session),
            PacketData::BinaryEvent(_, _, _) | PacketData::BinaryAck(_, _) => {
                // park the packet until its attachments arrive
                session
                    .data
                    .partial_bin_packet
                    .lock()
                    .unwrap()
                    .replace(Packet {
                        ns: packet.ns,
                        inner: packet.inner,
                    });
                Ok(())
            }
            inner => self.route(&packet.ns, inner, &session),
        };

        if let Err(ref err) = res {
            debug!(
                "[sid={}] error processing packet: {}",
                session.sid, err
            );
            if let Some(reason) = err.into() {
                session.close(reason);
            }
        }
    }

    /// Applies a binary frame to the pending packet; once complete the
    /// packet is routed like any other.
    fn on_binary(&self, data: Bytes, session: Arc<Session<SessionData<A>>>) {
        let complete = {
            let mut partial = session.data.partial_bin_packet.lock().unwrap();
            match partial.as_mut() {
                Some(packet) => match &mut packet.inner {
                    PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _) => {
                        bin.add_payload(data);
                        bin.is_complete()
                    }
                    _ => false,
                },
                None => {
                    debug!("[sid={}] unexpected binary frame", session.sid);
                    return;
                }
            }
        };
        if complete {
            let packet = session.data.partial_bin_packet.lock().unwrap().take();
            if let Some(packet) = packet {
                if let Err(ref err) = self.route(&packet.ns, packet.inner, &session) {
                    debug!(
                        "[sid={}] error processing binary packet: {}",
                        session.sid, err
                    );
                    if let Some(reason) = err.into() {
                        session.close(reason);
                    }
                }
            }
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Client<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("ns", &self.ns.read().unwrap().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use relayio_engine::{Packet as EnginePacket, Sid};

    use super::*;
    use crate::adapter::LocalAdapter;
    use crate::errors::AuthError;
    use crate::operators::Operators;

    fn create_client() -> Arc<Client<LocalAdapter>> {
        let client = Client::new(Arc::new(RelayConfig::default()));
        client.add_ns("/".into(), Arc::new(|_| Box::pin(async {}) as _), None);
        Arc::new(client)
    }

    /// Builds a dummy engine session wired to the client, returning the
    /// stream of packets the server emits on it and the close signal.
    fn create_session(
        client: &Arc<Client<LocalAdapter>>,
    ) -> (
        Arc<Session<SessionData<LocalAdapter>>>,
        mpsc::Receiver<EnginePacket>,
        mpsc::Receiver<EngineDisconnectReason>,
    ) {
        let (closed_tx, closed_rx) = mpsc::channel(1);
        let close_fn = Box::new(move |_, reason| {
            closed_tx.try_send(reason).ok();
        });
        let (session, rx) = Session::new_dummy_piped(Sid::new(), close_fn, 64);
        client.on_connect(session.clone());
        (session, rx, closed_rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<EnginePacket>) -> String {
        loop {
            let packet = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .expect("timed out waiting for a packet")
                .expect("session closed");
            if let EnginePacket::Message(msg) = packet {
                return msg.to_string();
            }
        }
    }

    async fn next_binary(rx: &mut mpsc::Receiver<EnginePacket>) -> Bytes {
        loop {
            let packet = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .expect("timed out waiting for a packet")
                .expect("session closed");
            if let EnginePacket::Binary(data) = packet {
                return data;
            }
        }
    }

    fn assert_silent(rx: &mut mpsc::Receiver<EnginePacket>) {
        match rx.try_recv() {
            Err(_) => (),
            Ok(packet) => panic!("expected no packet, got {packet:?}"),
        }
    }

    #[tokio::test]
    async fn connect_acknowledges_with_the_socket_id() {
        let client = create_client();
        let (session, mut rx, _) = create_session(&client);
        client.on_message("0".into(), session.clone());

        let ack = next_message(&mut rx).await;
        assert_eq!(ack, format!("0{}", json!({ "sid": session.sid })));

        let ns = client.get_ns("/").unwrap();
        let socket = ns.get_socket(session.sid).unwrap();
        assert!(socket.connected());
        // every socket is a member of the room named by its own id
        assert!(socket.rooms().contains(&session.sid.to_string().into()));
    }

    #[tokio::test]
    async fn unknown_namespace_is_refused() {
        let client = create_client();
        let (session, mut rx, _) = create_session(&client);
        client.on_message("0/nope,".into(), session.clone());

        let err = next_message(&mut rx).await;
        assert_eq!(
            err,
            format!("4/nope,{}", json!({ "message": "Invalid namespace" }))
        );
    }

    #[tokio::test]
    async fn authorizer_refusal_sends_a_connect_error() {
        let client = create_client();
        client.add_ns(
            "/admin".into(),
            Arc::new(|_| Box::pin(async {}) as _),
            Some(Arc::new(|handshake: &Handshake| {
                match handshake.auth.get("token") {
                    Some(_) => Ok(()),
                    None => Err(AuthError::with_data("auth failed", json!({ "code": 401 }))),
                }
            })),
        );
        let (session, mut rx, _) = create_session(&client);

        client.on_message("0/admin,".into(), session.clone());
        let err = next_message(&mut rx).await;
        assert_eq!(
            err,
            format!(
                "4/admin,{}",
                json!({ "message": "auth failed", "data": { "code": 401 } })
            )
        );

        client.on_message("0/admin,{\"token\":\"s3cret\"}".into(), session.clone());
        let ack = next_message(&mut rx).await;
        assert!(ack.starts_with("0/admin,"));
        // non default namespaces hand out their own socket ids
        let socket = session.data.sockets.lock().unwrap().get("/admin").cloned();
        assert_ne!(socket.unwrap().id, session.sid);
    }

    #[tokio::test]
    async fn middleware_chain_short_circuits() {
        let client = create_client();
        let ns = client.get_ns("/").unwrap();
        ns.use_middleware(Arc::new(|_, _| Ok(())));
        ns.use_middleware(Arc::new(|_, _| Err(AuthError::new("not today"))));
        let (session, mut rx, _) = create_session(&client);

        client.on_message("0".into(), session.clone());
        let err = next_message(&mut rx).await;
        assert_eq!(err, format!("4{}", json!({ "message": "not today" })));
        assert!(client.get_ns("/").unwrap().get_socket(session.sid).is_none());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let client = create_client();
        client.add_ns("/admin".into(), Arc::new(|_| Box::pin(async {}) as _), None);

        let (session_a, mut rx_a, _) = create_session(&client);
        let (session_b, mut rx_b, _) = create_session(&client);
        client.on_message("0".into(), session_a.clone());
        client.on_message("0/admin,".into(), session_b.clone());
        next_message(&mut rx_a).await;
        next_message(&mut rx_b).await;

        Operators::new(client.get_ns("/").unwrap())
            .emit("m", "hello")
            .unwrap();

        assert_eq!(
            next_message(&mut rx_a).await,
            format!("2{}", json!(["m", "hello"]))
        );
        assert_silent(&mut rx_b);
    }

    #[tokio::test]
    async fn room_broadcast_respects_except() {
        let client = create_client();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (session, mut rx, _) = create_session(&client);
            client.on_message("0".into(), session.clone());
            next_message(&mut rx).await;
            peers.push((session, rx));
        }

        let ns = client.get_ns("/").unwrap();
        for (session, _) in &peers {
            ns.get_socket(session.sid).unwrap().join("r");
        }

        let sender = ns.get_socket(peers[0].0.sid).unwrap();
        sender
            .to("r")
            .except(sender.id)
            .emit("x", 1)
            .unwrap();

        let expected = format!("2{}", json!(["x", 1]));
        assert_silent(&mut peers[0].1);
        assert_eq!(next_message(&mut peers[1].1).await, expected);
        assert_eq!(next_message(&mut peers[2].1).await, expected);
    }

    #[tokio::test]
    async fn binary_event_is_reassembled() {
        let client = create_client();
        let (session, mut rx, _) = create_session(&client);
        client.on_message("0".into(), session.clone());
        next_message(&mut rx).await;

        let (tx, mut received) = mpsc::channel::<(Value, Vec<Bytes>)>(1);
        let socket = client.get_ns("/").unwrap().get_socket(session.sid).unwrap();
        socket.on("buf", move |_, data, bin, _| {
            let tx = tx.clone();
            async move {
                tx.try_send((data, bin)).ok();
            }
        });

        client.on_message(
            "51-[\"buf\",{\"_placeholder\":true,\"num\":0}]".into(),
            session.clone(),
        );
        client.on_binary(Bytes::from_static(&[0xDE, 0xAD]), session.clone());

        let (data, bin) = tokio::time::timeout(Duration::from_millis(200), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, json!([]));
        assert_eq!(bin, vec![Bytes::from_static(&[0xDE, 0xAD])]);
    }

    #[tokio::test]
    async fn binary_reply_is_split_into_frames() {
        let client = create_client();
        let (session, mut rx, _) = create_session(&client);
        client.on_message("0".into(), session.clone());
        next_message(&mut rx).await;

        let socket = client.get_ns("/").unwrap().get_socket(session.sid).unwrap();
        socket
            .bin([Bytes::from_static(&[1, 2])])
            .emit("img", json!({ "name": "a" }))
            .unwrap();

        let msg = next_message(&mut rx).await;
        assert!(msg.starts_with("51-"), "unexpected frame: {msg}");
        assert_eq!(next_binary(&mut rx).await, Bytes::from_static(&[1, 2]));
    }

    #[tokio::test]
    async fn text_packet_interleaved_with_attachments_fails_the_session() {
        let client = create_client();
        let (session, mut rx, mut closed) = create_session(&client);
        client.on_message("0".into(), session.clone());
        next_message(&mut rx).await;

        client.on_message(
            "51-[\"buf\",{\"_placeholder\":true,\"num\":0}]".into(),
            session.clone(),
        );
        client.on_message("2[\"x\"]".into(), session.clone());

        let reason = tokio::time::timeout(Duration::from_millis(200), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, EngineDisconnectReason::PacketParsing);
    }

    #[tokio::test]
    async fn client_namespace_disconnect_removes_the_socket() {
        let client = create_client();
        let (session, mut rx, _) = create_session(&client);
        client.on_message("0".into(), session.clone());
        next_message(&mut rx).await;

        let ns = client.get_ns("/").unwrap();
        assert!(ns.get_socket(session.sid).is_some());

        client.on_message("1".into(), session.clone());
        assert!(ns.get_socket(session.sid).is_none());
        assert!(ns.adapter.socket_rooms(session.sid).is_empty());
        assert!(session.data.sockets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_disconnect_closes_every_namespace_socket() {
        let client = create_client();
        client.add_ns("/admin".into(), Arc::new(|_| Box::pin(async {}) as _), None);
        let (session, mut rx, _) = create_session(&client);
        client.on_message("0".into(), session.clone());
        client.on_message("0/admin,".into(), session.clone());
        next_message(&mut rx).await;
        next_message(&mut rx).await;

        client.on_disconnect(session.clone(), EngineDisconnectReason::TransportClose);

        assert!(client.get_ns("/").unwrap().get_sockets().is_empty());
        assert!(client.get_ns("/admin").unwrap().get_sockets().is_empty());
        assert!(session.data.sockets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dynamic_namespaces_instantiate_on_first_connect() {
        let client = create_client();
        client.add_dyn_ns(
            NsMatcher::Prefix("/room-".into()),
            Arc::new(|_| Box::pin(async {}) as _),
            None,
        );
        let (session, mut rx, _) = create_session(&client);

        assert!(client.get_ns("/room-7").is_none());
        client.on_message("0/room-7,".into(), session.clone());
        let ack = next_message(&mut rx).await;
        assert!(ack.starts_with("0/room-7,"));
        assert!(client.get_ns("/room-7").is_some());

        // unmatched paths are still refused
        client.on_message("0/elsewhere,".into(), session.clone());
        let err = next_message(&mut rx).await;
        assert!(err.starts_with("4/elsewhere,"));
    }

    #[tokio::test]
    async fn malformed_packet_closes_the_session() {
        let client = create_client();
        let (session, _rx, mut closed) = create_session(&client);
        client.on_message("nonsense".into(), session.clone());

        let reason = tokio::time::timeout(Duration::from_millis(200), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, EngineDisconnectReason::PacketParsing);
    }
}
