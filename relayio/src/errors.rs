use relayio_engine::{sid::Sid, DisconnectReason as EngineDisconnectReason};
use serde_json::Value;

/// Internal error type of the messaging layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("invalid event name")]
    InvalidEventName,

    #[error("binary attachment count does not match the packet header")]
    AttachmentCountMismatch,

    #[error("text packet received while binary attachments were pending")]
    UnexpectedTextPacket,

    #[error("cannot find socket: {0}")]
    SocketGone(Sid),

    #[error("engine error: {0}")]
    Engine(#[from] relayio_engine::errors::Error),
}

/// Maps an error to the disconnect reason it should close the session with,
/// if any. Application level errors never terminate the session.
impl From<&Error> for Option<EngineDisconnectReason> {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidPacketType
            | Error::InvalidEventName
            | Error::AttachmentCountMismatch
            | Error::UnexpectedTextPacket
            | Error::Serialize(_) => Some(EngineDisconnectReason::PacketParsing),
            Error::SocketGone(_) | Error::Engine(_) => None,
        }
    }
}

/// A connect-time refusal raised by an authorizer or a middleware.
///
/// It is sent back to the client as a CONNECT_ERROR packet scoped to the
/// namespace being joined; the session itself stays up.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection refused: {message}")]
pub struct AuthError {
    pub message: String,
    pub data: Option<Value>,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Error returned when emitting to a single socket.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),
    #[error("session write buffer full")]
    BufferFull,
    #[error("socket closed")]
    Closed,
}

impl From<relayio_engine::errors::Error> for SendError {
    fn from(err: relayio_engine::errors::Error) -> Self {
        use relayio_engine::errors::Error as EngineError;
        match err {
            EngineError::BufferFull => SendError::BufferFull,
            _ => SendError::Closed,
        }
    }
}

/// Error yielded while waiting for an acknowledgement.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The ack payload could not be deserialized to the expected type.
    #[error("error deserializing ack payload: {0:?}")]
    Serde(#[from] serde_json::Error),

    /// The client did not reply within the ack timeout.
    #[error("ack timeout")]
    Timeout,

    /// The socket was disconnected before the client replied.
    #[error("socket disconnected before the ack was received")]
    Disconnected,

    /// The packet could not be sent in the first place.
    #[error("send error: {0}")]
    Send(#[from] SendError),
}

/// Error returned by a broadcast: per-target failures never abort the
/// delivery to the other targets, so they are collected.
#[derive(thiserror::Error, Debug)]
pub enum BroadcastError {
    #[error("error sending to {} sockets", .0.len())]
    Send(Vec<SendError>),
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),
}

impl From<Vec<SendError>> for BroadcastError {
    fn from(errors: Vec<SendError>) -> Self {
        Self::Send(errors)
    }
}
