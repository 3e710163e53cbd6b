//! Acknowledgement plumbing.
//!
//! Emitting with an ack returns an [`AckStream`]: an awaitable handle that
//! carries its own timeout. Used as a [`Future`] it yields the first reply;
//! used as a [`Stream`] (after a broadcast) it yields one reply per target
//! until every target answered or timed out.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{
    future::FusedFuture,
    stream::{FusedStream, FuturesUnordered},
    Future, Stream,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{sync::oneshot::Receiver, time::Timeout};

use crate::errors::AckError;

/// A reply sent by the client for an ack id.
#[derive(Debug)]
pub struct AckResponse<T> {
    /// The reply arguments.
    pub data: T,
    /// The binary attachments of the reply, empty when there are none.
    pub binary: Vec<Bytes>,
}

/// What an ack completes with: the reply, or a timeout / disconnect error.
pub type AckResult<T> = Result<AckResponse<T>, AckError>;

pin_project_lite::pin_project! {
    /// The raw, untyped ack stream. Exposed so alternative [`Adapter`]
    /// implementations can build it; applications go through [`AckStream`].
    ///
    /// [`Adapter`]: crate::adapter::Adapter
    #[project = InnerProj]
    pub enum AckInnerStream {
        Stream {
            #[pin]
            rxs: FuturesUnordered<Timeout<Receiver<AckResult<Value>>>>,
        },
        Fut {
            #[pin]
            rx: Timeout<Receiver<AckResult<Value>>>,
            polled: bool,
        },
    }
}

impl AckInnerStream {
    /// Wraps the pending acks of a broadcast. Every receiver runs under the
    /// same deadline; targets that never reply surface as timeout errors.
    pub fn broadcast(rxs: Vec<Receiver<AckResult<Value>>>, timeout: Duration) -> Self {
        AckInnerStream::Stream {
            rxs: rxs
                .into_iter()
                .map(|rx| tokio::time::timeout(timeout, rx))
                .collect(),
        }
    }

    /// Wraps the pending ack of a single emit.
    pub fn send(rx: Receiver<AckResult<Value>>, timeout: Duration) -> Self {
        AckInnerStream::Fut {
            rx: tokio::time::timeout(timeout, rx),
            polled: false,
        }
    }
}

fn flatten(
    polled: Result<Result<AckResult<Value>, tokio::sync::oneshot::error::RecvError>, tokio::time::error::Elapsed>,
) -> AckResult<Value> {
    match polled {
        Ok(Ok(res)) => res,
        // the sender was dropped without firing: the socket is gone
        Ok(Err(_)) => Err(AckError::Disconnected),
        Err(_) => Err(AckError::Timeout),
    }
}

impl Stream for AckInnerStream {
    type Item = AckResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.project() {
            InnerProj::Stream { rxs, .. } => match rxs.poll_next(cx) {
                Poll::Ready(Some(res)) => Poll::Ready(Some(flatten(res))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            InnerProj::Fut { polled, .. } if *polled => Poll::Ready(None),
            InnerProj::Fut { rx, polled } => match rx.poll(cx) {
                Poll::Ready(res) => {
                    *polled = true;
                    Poll::Ready(Some(flatten(res)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            AckInnerStream::Stream { rxs, .. } => rxs.size_hint(),
            AckInnerStream::Fut { .. } => (1, Some(1)),
        }
    }
}

impl FusedStream for AckInnerStream {
    fn is_terminated(&self) -> bool {
        match self {
            AckInnerStream::Stream { rxs, .. } => rxs.is_terminated(),
            AckInnerStream::Fut { polled, .. } => *polled,
        }
    }
}

pin_project_lite::pin_project! {
    /// Awaitable handle for one or many pending acknowledgements.
    ///
    /// As a [`Future`] it resolves to the first reply received; as a
    /// [`Stream`] it yields every reply of a broadcast. The deadline is
    /// carried by the handle itself, so dropping it cancels the wait
    /// without leaking a timer.
    #[must_use = "futures and streams do nothing unless you `.await` or poll them"]
    pub struct AckStream<T> {
        #[pin]
        inner: AckInnerStream,
        _marker: std::marker::PhantomData<T>,
    }
}

impl<T> From<AckInnerStream> for AckStream<T> {
    fn from(inner: AckInnerStream) -> Self {
        Self {
            inner,
            _marker: std::marker::PhantomData,
        }
    }
}

fn deserialize_response<T: DeserializeOwned>(res: AckResult<Value>) -> AckResult<T> {
    res.and_then(|res| {
        serde_json::from_value(res.data)
            .map(|data| AckResponse {
                data,
                binary: res.binary,
            })
            .map_err(AckError::from)
    })
}

impl<T: DeserializeOwned> Stream for AckStream<T> {
    type Item = AckResult<T>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .inner
            .poll_next(cx)
            .map(|res| res.map(deserialize_response))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T: DeserializeOwned> FusedStream for AckStream<T> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

impl<T: DeserializeOwned> Future for AckStream<T> {
    type Output = AckResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().inner.poll_next(cx) {
            Poll::Ready(Some(res)) => Poll::Ready(deserialize_response(res)),
            Poll::Ready(None) => unreachable!("an ack stream yields at least one result"),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: DeserializeOwned> FusedFuture for AckStream<T> {
    fn is_terminated(&self) -> bool {
        FusedStream::is_terminated(&self.inner)
    }
}
