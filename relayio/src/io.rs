use std::{borrow::Cow, sync::Arc, time::Duration};

use futures::Future;

use relayio_engine::{config::EngineConfigBuilder, service::TransportType};

use crate::{
    adapter::{Adapter, LocalAdapter},
    client::{Client, NsMatcher},
    config::RelayConfig,
    errors::AuthError,
    handshake::Handshake,
    layer::RelayIoLayer,
    ns::{Authorizer, NsCallback},
    operators::Operators,
    service::RelayIoService,
    socket::Socket,
};

fn make_callback<A, C, F>(callback: C) -> NsCallback<A>
where
    A: Adapter,
    C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |socket| Box::pin(callback(socket)) as futures::future::BoxFuture<'static, ()>)
}

fn make_authorizer<C>(authorizer: C) -> Authorizer
where
    C: Fn(&Handshake) -> Result<(), AuthError> + Send + Sync + 'static,
{
    Arc::new(authorizer)
}

/// Builder for a relayio server.
///
/// Configures the engine and messaging timings, registers the namespaces,
/// and finishes as either a tower [`Layer`](RelayIoLayer) or a standalone
/// [`Service`](RelayIoService).
pub struct RelayIoBuilder<A: Adapter = LocalAdapter> {
    config: RelayConfig,
    engine_builder: EngineConfigBuilder,
    req_path: String,
    registrations: Vec<Box<dyn FnOnce(&Client<A>) + Send>>,
}

impl RelayIoBuilder<LocalAdapter> {
    pub fn new() -> Self {
        Self::new_with_adapter()
    }
}

impl<A: Adapter> RelayIoBuilder<A> {
    /// Starts a builder for a custom adapter implementation.
    pub fn new_with_adapter() -> Self {
        Self {
            config: RelayConfig::default(),
            engine_builder: EngineConfigBuilder::new(),
            req_path: "/socket.io".to_string(),
            registrations: Vec::new(),
        }
    }

    /// The path the server answers on. Defaults to "/socket.io".
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.req_path = req_path.into();
        self
    }

    /// Interval between two server initiated PING packets.
    /// Defaults to 25 seconds.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.engine_builder = self.engine_builder.ping_interval(ping_interval);
        self
    }

    /// How long the server waits for a PONG before closing the session.
    /// Defaults to 20 seconds.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.engine_builder = self.engine_builder.ping_timeout(ping_timeout);
        self
    }

    /// Number of packets a session buffers before emits start failing.
    /// Defaults to 128.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.engine_builder = self.engine_builder.max_buffer_size(max_buffer_size);
        self
    }

    /// Maximum long-poll payload size in bytes. Defaults to 100kb.
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.engine_builder = self.engine_builder.max_payload(max_payload);
        self
    }

    /// The transports accepted by this server.
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        self.engine_builder = self.engine_builder.transports(transports);
        self
    }

    /// How long an emitter waits for an acknowledgement by default.
    /// Defaults to 5 seconds.
    pub fn ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.config.ack_timeout = ack_timeout;
        self
    }

    /// How long a session may stay without joining a namespace.
    /// Defaults to 45 seconds.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config.connect_timeout = connect_timeout;
        self
    }

    /// Registers a namespace with its connection callback.
    pub fn ns<C, F>(mut self, path: impl Into<Cow<'static, str>>, callback: C) -> Self
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let path = path.into();
        let callback = make_callback(callback);
        self.registrations.push(Box::new(move |client| {
            client.add_ns(path, callback, None);
        }));
        self
    }

    /// Registers a namespace gated by an authorizer: a handshake the
    /// authorizer refuses gets a CONNECT_ERROR instead of a socket.
    pub fn ns_with_auth<C, F, Auth>(
        mut self,
        path: impl Into<Cow<'static, str>>,
        callback: C,
        authorizer: Auth,
    ) -> Self
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
        Auth: Fn(&Handshake) -> Result<(), AuthError> + Send + Sync + 'static,
    {
        let path = path.into();
        let callback = make_callback(callback);
        let authorizer = make_authorizer(authorizer);
        self.registrations.push(Box::new(move |client| {
            client.add_ns(path, callback, Some(authorizer));
        }));
        self
    }

    /// Registers a dynamic namespace: the matcher decides at first CONNECT
    /// whether the requested path instantiates one.
    pub fn dyn_ns<C, F>(mut self, matcher: NsMatcher, callback: C) -> Self
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let callback = make_callback(callback);
        self.registrations.push(Box::new(move |client| {
            client.add_dyn_ns(matcher, callback, None);
        }));
        self
    }

    fn build_client(mut self) -> Arc<Client<A>> {
        self.config.engine_config = self.engine_builder.req_path(self.req_path).build();
        let client = Arc::new(Client::new(Arc::new(self.config)));
        for register in self.registrations {
            register(&client);
        }
        client
    }

    /// Builds a tower [`Layer`](tower::Layer) and the [`RelayIo`] handle.
    pub fn build_layer(self) -> (RelayIoLayer<A>, RelayIo<A>) {
        let client = self.build_client();
        (RelayIoLayer::from_client(client.clone()), RelayIo(client))
    }

    /// Builds a standalone service answering 404 outside the engine path,
    /// plus the [`RelayIo`] handle.
    pub fn build_svc(self) -> (RelayIoService<relayio_engine::service::NotFoundService, A>, RelayIo<A>) {
        let client = self.build_client();
        (
            RelayIoService::with_client(relayio_engine::service::NotFoundService, client.clone()),
            RelayIo(client),
        )
    }

    /// Builds a service wrapping a custom inner service, plus the
    /// [`RelayIo`] handle.
    pub fn build_with_inner_svc<S: Clone>(self, svc: S) -> (RelayIoService<S, A>, RelayIo<A>) {
        let client = self.build_client();
        (RelayIoService::with_client(svc, client.clone()), RelayIo(client))
    }
}

impl Default for RelayIoBuilder<LocalAdapter> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running server. Cheap to clone and to move around; this is
/// how application code reaches namespaces outside of a socket callback.
pub struct RelayIo<A: Adapter = LocalAdapter>(Arc<Client<A>>);

impl RelayIo<LocalAdapter> {
    pub fn builder() -> RelayIoBuilder<LocalAdapter> {
        RelayIoBuilder::new()
    }
}

impl<A: Adapter> RelayIo<A> {
    /// The server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.0.config
    }

    /// Registers a namespace after the server was built.
    pub fn ns<C, F>(&self, path: impl Into<Cow<'static, str>>, callback: C)
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.add_ns(path.into(), make_callback(callback), None);
    }

    /// Registers an authorizer gated namespace after the server was built.
    pub fn ns_with_auth<C, F, Auth>(&self, path: impl Into<Cow<'static, str>>, callback: C, authorizer: Auth)
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
        Auth: Fn(&Handshake) -> Result<(), AuthError> + Send + Sync + 'static,
    {
        self.0
            .add_ns(path.into(), make_callback(callback), Some(make_authorizer(authorizer)));
    }

    /// Registers a dynamic namespace matcher after the server was built.
    pub fn dyn_ns<C, F>(&self, matcher: NsMatcher, callback: C)
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.add_dyn_ns(matcher, make_callback(callback), None);
    }

    /// Appends a connect middleware to a namespace. Returns `false` when
    /// the namespace does not exist.
    pub fn use_middleware<C>(&self, path: &str, middleware: C) -> bool
    where
        C: Fn(&Arc<Socket<A>>, &Handshake) -> Result<(), AuthError> + Send + Sync + 'static,
    {
        match self.0.get_ns(path) {
            Some(ns) => {
                ns.use_middleware(Arc::new(middleware));
                true
            }
            None => false,
        }
    }

    /// Broadcast operators rooted at a namespace: `io.of("/chat")?.emit(…)`.
    pub fn of(&self, path: &str) -> Option<Operators<A>> {
        self.0.get_ns(path).map(Operators::new)
    }

    /// Removes a namespace, disconnecting everyone on it.
    pub fn delete_ns(&self, path: &str) {
        self.0.delete_ns(path)
    }

    /// Graceful shutdown: every namespace broadcasts its disconnect and
    /// every session is closed. New handshakes stop once the listener is
    /// dropped by the embedding server.
    pub fn close(&self) {
        self.0.close()
    }
}

impl<A: Adapter> Clone for RelayIo<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: Adapter> From<Arc<Client<A>>> for RelayIo<A> {
    fn from(client: Arc<Client<A>>) -> Self {
        Self(client)
    }
}

impl<A: Adapter> std::fmt::Debug for RelayIo<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RelayIo").field(&self.0).finish()
    }
}
