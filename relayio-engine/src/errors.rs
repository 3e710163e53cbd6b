use http::{Response, StatusCode};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::{body::ResponseBody, packet::Packet, sid::Sid};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),
    #[error("error decoding base64 packet: {0:?}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid packet type")]
    InvalidPacketType,
    #[error("io error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("bad packet received: {0:?}")]
    BadPacket(Packet),
    #[error("ws transport error: {0:?}")]
    WsTransport(#[from] tungstenite::Error),
    #[error("http transport error: {0:?}")]
    HttpTransport(#[from] hyper::Error),
    #[error("http error: {0:?}")]
    Http(#[from] http::Error),
    #[error("session write buffer full")]
    BufferFull,
    #[error("session closed")]
    SessionClosed,
    #[error("unknown session id: {0}")]
    UnknownSession(Sid),
    #[error("request transport does not match the session transport")]
    TransportMismatch,
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("upgrade error")]
    UpgradeError,
    #[error("payload exceeds the maxPayload limit")]
    PayloadTooLarge,
    #[error("session channel aborted")]
    Aborted,
    #[error("http error response: {0:?}")]
    HttpErrorResponse(StatusCode),
}

impl<T> From<mpsc::error::TrySendError<T>> for Error {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => Error::BufferFull,
            mpsc::error::TrySendError::Closed(_) => Error::SessionClosed,
        }
    }
}

/// Converts an error into the http response sent back to the peer.
/// Known request-level errors map to their status code, everything else is a 500.
impl<B> From<Error> for Response<ResponseBody<B>> {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::HttpErrorResponse(code) => code,
            Error::UnknownSession(_)
            | Error::TransportMismatch
            | Error::PayloadTooLarge
            | Error::InvalidPacketType
            | Error::Serialize(_)
            | Error::Base64(_)
            | Error::BadPacket(_) => StatusCode::BAD_REQUEST,
            e => {
                tracing::debug!("uncaught error: {e:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Response::builder()
            .status(status)
            .body(ResponseBody::empty_response())
            .unwrap()
    }
}
