//! Response body wrapper so the engine can return its own bodies or forward
//! the one produced by the inner service.

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Body, Empty, Full, SizeHint};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

#[pin_project(project = BodyProj)]
pub enum ResponseBody<B> {
    Empty {
        #[pin]
        body: Empty<Bytes>,
    },
    Custom {
        #[pin]
        body: Full<Bytes>,
    },
    Inner {
        #[pin]
        body: B,
    },
}

impl<B> ResponseBody<B> {
    pub fn empty_response() -> Self {
        ResponseBody::Empty { body: Empty::new() }
    }

    pub fn custom_response(body: Full<Bytes>) -> Self {
        ResponseBody::Custom { body }
    }

    pub fn new(body: B) -> Self {
        ResponseBody::Inner { body }
    }
}

impl<B> Default for ResponseBody<B> {
    fn default() -> Self {
        Self::empty_response()
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + 'static,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        match self.project() {
            BodyProj::Empty { body } => body.poll_data(cx).map_err(|err| match err {}),
            BodyProj::Custom { body } => body.poll_data(cx).map_err(|err| match err {}),
            BodyProj::Inner { body } => body.poll_data(cx),
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        match self.project() {
            BodyProj::Empty { body } => body.poll_trailers(cx).map_err(|err| match err {}),
            BodyProj::Custom { body } => body.poll_trailers(cx).map_err(|err| match err {}),
            BodyProj::Inner { body } => body.poll_trailers(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ResponseBody::Empty { body } => body.is_end_stream(),
            ResponseBody::Custom { body } => body.is_end_stream(),
            ResponseBody::Inner { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ResponseBody::Empty { body } => body.size_hint(),
            ResponseBody::Custom { body } => body.size_hint(),
            ResponseBody::Inner { body } => body.size_hint(),
        }
    }
}
