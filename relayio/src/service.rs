//! A tower [`Service`] wrapping the engine service, so the messaging layer
//! can be mounted in any tower/hyper based stack.

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use http::{Request, Response};
use http_body::Body;
use tower::Service;

use relayio_engine::service::{EngineService, MakeEngineService, NotFoundService};

use crate::{
    adapter::{Adapter, LocalAdapter},
    client::Client,
};

/// A [`Service`] that answers relayio requests and forwards everything else
/// to the inner service.
pub struct RelayIoService<S: Clone, A: Adapter = LocalAdapter> {
    engine_svc: EngineService<Arc<Client<A>>, S>,
}

impl<A: Adapter, ReqBody, ResBody, S> Service<Request<ReqBody>> for RelayIoService<S, A>
where
    ResBody: Body + Send + 'static,
    ReqBody: Body + Send + 'static + std::fmt::Debug + Unpin,
    <ReqBody as Body>::Error: std::fmt::Debug,
    <ReqBody as Body>::Data: Send,
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone,
{
    type Response = <EngineService<Arc<Client<A>>, S> as Service<Request<ReqBody>>>::Response;
    type Error = <EngineService<Arc<Client<A>>, S> as Service<Request<ReqBody>>>::Error;
    type Future = <EngineService<Arc<Client<A>>, S> as Service<Request<ReqBody>>>::Future;

    #[inline(always)]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.engine_svc.poll_ready(cx)
    }

    #[inline(always)]
    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        self.engine_svc.call(req)
    }
}

impl<A: Adapter, S: Clone> RelayIoService<S, A> {
    /// Converts into a `MakeService` usable directly by hyper.
    #[inline(always)]
    pub fn into_make_service(self) -> MakeEngineService<Arc<Client<A>>, S> {
        self.engine_svc.into_make_service()
    }

    pub(crate) fn with_client(inner: S, client: Arc<Client<A>>) -> Self {
        let engine_config = client.config.engine_config.clone();
        let engine_svc = EngineService::with_config_inner(inner, client, engine_config);
        Self { engine_svc }
    }
}

impl<A: Adapter> RelayIoService<NotFoundService, A> {
    /// A standalone service answering 404 outside the engine path.
    pub fn standalone(client: Arc<Client<A>>) -> Self {
        Self::with_client(NotFoundService, client)
    }
}

impl<A: Adapter, S: Clone> Clone for RelayIoService<S, A> {
    fn clone(&self) -> Self {
        Self {
            engine_svc: self.engine_svc.clone(),
        }
    }
}
