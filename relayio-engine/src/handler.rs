use std::sync::Arc;

use bytes::Bytes;

use crate::{
    session::{DisconnectReason, Session},
    str::Str,
};

/// Receives the lifecycle and message events of every session.
///
/// The layer above the engine implements this trait to turn raw engine
/// messages into its own protocol. A `Data` type can be attached to each
/// session to carry per-session state across calls.
pub trait SessionHandler: std::fmt::Debug + Send + Sync + 'static {
    /// State bound to each session.
    type Data: Default + Send + Sync + 'static;

    /// A session completed its handshake.
    fn on_connect(&self, session: Arc<Session<Self::Data>>);

    /// A session was closed.
    fn on_disconnect(&self, session: Arc<Session<Self::Data>>, reason: DisconnectReason);

    /// A message frame arrived on the session.
    fn on_message(&self, msg: Str, session: Arc<Session<Self::Data>>);

    /// A binary frame arrived on the session.
    fn on_binary(&self, data: Bytes, session: Arc<Session<Self::Data>>);
}

impl<T: SessionHandler> SessionHandler for Arc<T> {
    type Data = T::Data;

    fn on_connect(&self, session: Arc<Session<Self::Data>>) {
        (**self).on_connect(session)
    }
    fn on_disconnect(&self, session: Arc<Session<Self::Data>>, reason: DisconnectReason) {
        (**self).on_disconnect(session, reason)
    }
    fn on_message(&self, msg: Str, session: Arc<Session<Self::Data>>) {
        (**self).on_message(msg, session)
    }
    fn on_binary(&self, data: Bytes, session: Arc<Session<Self::Data>>) {
        (**self).on_binary(data, session)
    }
}
