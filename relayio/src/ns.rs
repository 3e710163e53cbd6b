use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use futures::future::BoxFuture;
use tracing::debug;

use relayio_engine::{sid::Sid, Session};

use crate::{
    adapter::{Adapter, Room},
    client::SessionData,
    config::RelayConfig,
    errors::AuthError,
    handshake::Handshake,
    packet::Packet,
    socket::{DisconnectReason, Socket},
};

/// The callback invoked with every socket that joins the namespace.
pub(crate) type NsCallback<A> =
    Arc<dyn Fn(Arc<Socket<A>>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Decides at connect time whether a handshake may join the namespace.
pub(crate) type Authorizer = Arc<dyn Fn(&Handshake) -> Result<(), AuthError> + Send + Sync>;

/// A connect middleware. The chain runs in registration order after the
/// authorizer and short-circuits on the first error.
pub(crate) type Middleware<A> =
    Arc<dyn Fn(&Arc<Socket<A>>, &Handshake) -> Result<(), AuthError> + Send + Sync>;

/// A logical channel: its socket registry, its adapter and its connect
/// gatekeepers. Sibling namespaces share the engine but nothing else.
pub struct Namespace<A: Adapter> {
    pub path: Cow<'static, str>,
    pub(crate) adapter: A,
    pub(crate) config: Arc<RelayConfig>,
    callback: NsCallback<A>,
    authorizer: Option<Authorizer>,
    middlewares: RwLock<Vec<Middleware<A>>>,
    sockets: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
}

impl<A: Adapter> Namespace<A> {
    pub(crate) fn new(
        path: Cow<'static, str>,
        callback: NsCallback<A>,
        authorizer: Option<Authorizer>,
        config: Arc<RelayConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|ns| Self {
            path,
            adapter: A::new(ns.clone()),
            config,
            callback,
            authorizer,
            middlewares: RwLock::new(Vec::new()),
            sockets: RwLock::new(HashMap::new()),
        })
    }

    /// Appends a connect middleware to the chain.
    pub(crate) fn use_middleware(&self, middleware: Middleware<A>) {
        self.middlewares.write().unwrap().push(middleware);
    }

    /// Runs the connect handshake for a session joining this namespace.
    ///
    /// On success the socket is registered, a member of the room named by
    /// its own id, and the CONNECT acknowledgement is on the wire before
    /// the connection callback runs. On refusal nothing is registered and
    /// the caller sends the CONNECT_ERROR.
    pub(crate) fn connect(
        self: &Arc<Self>,
        esession: Arc<Session<SessionData<A>>>,
        handshake: Handshake,
    ) -> Result<(), AuthError> {
        if let Some(authorizer) = &self.authorizer {
            authorizer(&handshake)?;
        }

        // the engine sid doubles as the socket id on the default namespace;
        // every other namespace hands out its own ids
        let sid = if self.path == "/" {
            esession.sid
        } else {
            Sid::new()
        };
        let socket = Arc::new(Socket::new(
            sid,
            self.clone(),
            esession.clone(),
            handshake,
            self.config.clone(),
        ));

        for middleware in self.middlewares.read().unwrap().iter() {
            middleware(&socket, socket.handshake())?;
        }

        self.sockets.write().unwrap().insert(sid, socket.clone());
        esession
            .data
            .sockets
            .lock()
            .unwrap()
            .insert(self.path.clone(), socket.clone());
        // every socket is a member of the room named by its own id, which
        // is what makes "emit to one socket" a one-room broadcast
        self.adapter.add_all(sid, Room::from(sid.to_string()));
        socket.set_connected();

        if socket.send(Packet::connect(&self.path, sid)).is_err() {
            debug!("[sid={sid}] could not send the connect ack, closing");
            socket
                .clone()
                .close(DisconnectReason::TransportError);
            esession.close(relayio_engine::DisconnectReason::PacketParsing);
            return Ok(());
        }

        tokio::spawn((self.callback)(socket));
        Ok(())
    }

    /// Unregisters a socket and clears its adapter state. Called from
    /// [`Socket::close`] only.
    pub(crate) fn remove_socket(&self, sid: Sid) {
        self.sockets.write().unwrap().remove(&sid);
        self.adapter.del_all(sid);
    }

    pub fn get_socket(&self, sid: Sid) -> Option<Arc<Socket<A>>> {
        self.sockets.read().unwrap().get(&sid).cloned()
    }

    pub fn get_sockets(&self) -> Vec<Arc<Socket<A>>> {
        self.sockets.read().unwrap().values().cloned().collect()
    }

    /// Closes the whole namespace: every socket gets a DISCONNECT packet,
    /// its disconnect handling, and its underlying session is closed.
    pub(crate) fn close(&self, reason: DisconnectReason) {
        debug!("closing namespace {}", self.path);
        self.adapter.close();
        let sockets: Vec<_> = self.sockets.read().unwrap().values().cloned().collect();
        for socket in sockets {
            socket.send(Packet::disconnect(&self.path)).ok();
            socket.clone().close(reason);
            socket.close_underlying_session();
        }
        self.sockets.write().unwrap().shrink_to_fit();
    }
}

impl<A: Adapter> std::fmt::Debug for Namespace<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("sockets", &self.sockets.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
impl<A: Adapter> Namespace<A> {
    /// A namespace pre-populated with dummy sockets, for adapter and socket
    /// level tests.
    pub(crate) fn new_dummy<const N: usize>(sockets: [Sid; N]) -> Arc<Self> {
        let ns = Namespace::new(
            Cow::Borrowed("/"),
            Arc::new(|_| Box::pin(async {}) as _),
            None,
            Arc::new(RelayConfig::default()),
        );
        for sid in sockets {
            let socket = Arc::new(Socket::new_dummy(sid, ns.clone()));
            socket.set_connected();
            ns.sockets.write().unwrap().insert(sid, socket);
        }
        ns
    }

    /// Registers an externally built socket, for socket level tests.
    pub(crate) fn insert_socket(&self, socket: Arc<Socket<A>>) {
        self.sockets.write().unwrap().insert(socket.id, socket);
    }
}
