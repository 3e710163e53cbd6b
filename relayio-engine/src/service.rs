use std::{
    convert::Infallible,
    fmt::Debug,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::future::{ready, Ready};
use http::{Method, Request, Response};
use http_body::{Body, Empty};
use hyper::service::Service;

use crate::{
    body::ResponseBody, config::EngineConfig, engine::EngineServer, futures::ResponseFuture,
    handler::SessionHandler, sid::Sid,
};

/// The engine protocol version this server speaks.
pub const PROTOCOL_VERSION: u8 = 4;

/// A [`Service`] that answers engine requests and forwards everything else
/// to the inner service.
///
/// By default the inner service is a [`NotFoundService`], which makes this a
/// standalone service answering 404 to non-engine requests.
pub struct EngineService<H, S = NotFoundService>
where
    H: SessionHandler,
{
    inner: S,
    engine: Arc<EngineServer<H>>,
}

impl<H: SessionHandler> EngineService<H, NotFoundService> {
    /// Creates a standalone service with the default config.
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, EngineConfig::default())
    }

    /// Creates a standalone service with a custom config.
    pub fn with_config(handler: H, config: EngineConfig) -> Self {
        EngineService {
            inner: NotFoundService,
            engine: Arc::new(EngineServer::new(handler, config)),
        }
    }
}

impl<H: SessionHandler, S: Clone> EngineService<H, S> {
    /// Creates a service with a custom inner service and config.
    pub fn with_config_inner(inner: S, handler: H, config: EngineConfig) -> Self {
        EngineService {
            inner,
            engine: Arc::new(EngineServer::new(handler, config)),
        }
    }

    /// Converts this service into a `MakeService` usable directly by hyper.
    pub fn into_make_service(self) -> MakeEngineService<H, S> {
        MakeEngineService { svc: self }
    }
}

impl<H: SessionHandler, S: Clone> Clone for EngineService<H, S> {
    fn clone(&self) -> Self {
        EngineService {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<ReqBody, ResBody, S, H> Service<Request<ReqBody>> for EngineService<H, S>
where
    ResBody: Body + Send + 'static,
    ReqBody: http_body::Body + Send + 'static + Debug,
    <ReqBody as http_body::Body>::Error: Debug,
    <ReqBody as http_body::Body>::Data: Send,
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    H: SessionHandler,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    /// Parses the request query to route it: handshake, poll, post or
    /// websocket upgrade. Anything unparseable is a 400; anything outside
    /// the engine path goes to the inner service.
    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if req.uri().path().starts_with(&self.engine.config.req_path) {
            let engine = self.engine.clone();
            match RequestInfo::parse(&req, &engine.config) {
                Ok(RequestInfo {
                    sid: None,
                    transport: TransportType::Polling,
                    method: Method::GET,
                }) => ResponseFuture::ready(engine.on_open_req(req)),
                Ok(RequestInfo {
                    sid: Some(sid),
                    transport: TransportType::Polling,
                    method: Method::GET,
                }) => ResponseFuture::async_response(Box::pin(engine.on_polling_req(sid))),
                Ok(RequestInfo {
                    sid: Some(sid),
                    transport: TransportType::Polling,
                    method: Method::POST,
                }) => ResponseFuture::async_response(Box::pin(engine.on_post_req(sid, req))),
                Ok(RequestInfo {
                    sid,
                    transport: TransportType::Websocket,
                    method: Method::GET,
                }) => ResponseFuture::ready(engine.on_ws_req(sid, req)),
                _ => ResponseFuture::empty_response(400),
            }
        } else {
            ResponseFuture::new(self.inner.call(req))
        }
    }
}

/// A `MakeService` that hands out clones of one [`EngineService`].
pub struct MakeEngineService<H, S>
where
    H: SessionHandler,
{
    svc: EngineService<H, S>,
}

impl<H, S, T> Service<T> for MakeEngineService<H, S>
where
    H: SessionHandler,
    S: Clone,
{
    type Response = EngineService<H, S>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: T) -> Self::Future {
        ready(Ok(self.svc.clone()))
    }
}

/// A [`Service`] that always answers 404, used as the standalone fallback.
#[derive(Debug, Clone)]
pub struct NotFoundService;
impl<ReqBody> Service<Request<ReqBody>> for NotFoundService
where
    ReqBody: http_body::Body + Send + 'static + Debug,
    <ReqBody as http_body::Body>::Error: Debug,
    <ReqBody as http_body::Body>::Data: Send,
{
    type Response = Response<ResponseBody<Empty<Bytes>>>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: Request<ReqBody>) -> Self::Future {
        ready(Ok(Response::builder()
            .status(404)
            .body(ResponseBody::empty_response())
            .unwrap()))
    }
}

/// The transport named in the request query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Polling = 0b01,
    Websocket = 0b10,
}

impl TransportType {
    pub fn name(&self) -> &'static str {
        match self {
            TransportType::Polling => "polling",
            TransportType::Websocket => "websocket",
        }
    }
}

impl FromStr for TransportType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportType::Polling),
            "websocket" => Ok(TransportType::Websocket),
            _ => Err(()),
        }
    }
}

/// The routing data parsed out of the request query.
#[derive(Debug)]
struct RequestInfo {
    sid: Option<Sid>,
    transport: TransportType,
    method: Method,
}

impl RequestInfo {
    fn parse<B>(req: &Request<B>, config: &EngineConfig) -> Result<Self, ()> {
        let query = req.uri().query().ok_or(())?;
        if !query
            .split('&')
            .any(|s| s == format!("EIO={PROTOCOL_VERSION}"))
        {
            return Err(());
        }

        let transport: TransportType = query
            .split('&')
            .find_map(|s| s.strip_prefix("transport="))
            .ok_or(())?
            .parse()?;
        if !config.allows(transport) {
            return Err(());
        }

        // a present but malformed sid is a bad request, not a new handshake
        let sid = query
            .split('&')
            .find_map(|s| s.strip_prefix("sid="))
            .map(|sid| Sid::from_str(sid).map_err(|_| ()))
            .transpose()?;

        Ok(RequestInfo {
            sid,
            transport,
            method: req.method().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_request(path: &str) -> Request<()> {
        Request::get(path).body(()).unwrap()
    }

    #[test]
    fn parse_polling_handshake() {
        let req = build_request("http://localhost:3000/relay.io/?EIO=4&transport=polling");
        let info = RequestInfo::parse(&req, &EngineConfig::default()).unwrap();
        assert_eq!(info.sid, None);
        assert_eq!(info.transport, TransportType::Polling);
        assert_eq!(info.method, Method::GET);
    }

    #[test]
    fn parse_websocket_with_sid() {
        let sid = Sid::new();
        let req = build_request(&format!(
            "http://localhost:3000/relay.io/?EIO=4&transport=websocket&sid={sid}"
        ));
        let info = RequestInfo::parse(&req, &EngineConfig::default()).unwrap();
        assert_eq!(info.sid, Some(sid));
        assert_eq!(info.transport, TransportType::Websocket);
    }

    #[test]
    fn parse_rejects_wrong_protocol_version() {
        let req = build_request("http://localhost:3000/relay.io/?EIO=3&transport=polling");
        assert!(RequestInfo::parse(&req, &EngineConfig::default()).is_err());
    }

    #[test]
    fn parse_rejects_unknown_transport() {
        let req = build_request("http://localhost:3000/relay.io/?EIO=4&transport=carrier-pigeon");
        assert!(RequestInfo::parse(&req, &EngineConfig::default()).is_err());
    }

    #[test]
    fn parse_rejects_disallowed_transport() {
        let config = EngineConfig::builder()
            .transports([TransportType::Polling])
            .build();
        let req = build_request("http://localhost:3000/relay.io/?EIO=4&transport=websocket");
        assert!(RequestInfo::parse(&req, &config).is_err());
    }

    #[test]
    fn parse_rejects_malformed_sid() {
        let req = build_request("http://localhost:3000/relay.io/?EIO=4&transport=polling&sid=!!");
        assert!(RequestInfo::parse(&req, &EngineConfig::default()).is_err());
    }
}
